// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;

use bijux_drift_analysis::{classify, compare, similarity};
use bijux_drift_model::{
    ArtifactKind, ClassificationKind, ContractModel, Endpoint, EndpointKey, Evidence, FieldSet,
    HttpMethod, IssueId, IssueRecord, Layer, LayerPair, Mismatch, MismatchKind,
};
use proptest::prelude::*;

fn tri() -> impl Strategy<Value = Option<bool>> {
    prop_oneof![Just(None), Just(Some(true)), Just(Some(false))]
}

fn word() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("login"),
        Just("token"),
        Just("refresh"),
        Just("invoice"),
        Just("timeout"),
        Just("crash"),
        Just("upload"),
        Just("session"),
    ]
    .prop_map(str::to_string)
}

fn record(seq: u64) -> impl Strategy<Value = IssueRecord> {
    (
        proptest::collection::vec(word(), 0..6),
        prop_oneof![Just("auth"), Just("Auth "), Just("billing")],
        proptest::collection::btree_set(prop_oneof![Just("src/a.rs"), Just("./src/b.rs")], 0..3),
    )
        .prop_map(move |(words, component, files)| {
            let mut r = IssueRecord::new(IssueId::from_sequence(seq), seq, component, &words.join(" "));
            r.files = files.into_iter().map(str::to_string).collect();
            r
        })
}

fn mismatch() -> Mismatch {
    Mismatch::new(
        EndpointKey::new(HttpMethod::Patch, "/orders/{}"),
        LayerPair::SpecServerRequest,
        MismatchKind::FieldExtra,
        BTreeSet::new(),
        BTreeSet::from(["note".to_string()]),
        BTreeSet::new(),
    )
    .expect("mismatch")
}

proptest! {
    #[test]
    fn classification_is_a_pure_function_of_evidence(h in tri(), r in tri(), g in tri()) {
        let m = mismatch();
        let mut ev = Evidence::new(m.id.clone());
        ev.handler_exists = h;
        ev.routing_correct = r;
        ev.recent_regeneration = g;
        let first = classify(&m, &ev);
        let second = classify(&m, &ev.clone());
        prop_assert_eq!(&first, &second);
        if first.kind != ClassificationKind::TrueRegression {
            prop_assert!(!first.is_low_confidence());
        }
        if first.is_low_confidence() {
            prop_assert_eq!(first.kind, ClassificationKind::TrueRegression);
        }
    }

    #[test]
    fn similarity_is_symmetric_and_bounded(a in record(1), b in record(2)) {
        let ab = similarity(&a, &b);
        let ba = similarity(&b, &a);
        prop_assert!((ab - ba).abs() < 1e-12);
        prop_assert!((0.0..=1.0).contains(&ab));
        prop_assert!((similarity(&a, &a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn identical_layers_never_mismatch(names in proptest::collection::btree_set("[a-z]{1,6}", 0..8)) {
        let ep = Endpoint::new(HttpMethod::Post, "/items");
        let set = FieldSet::from_names("f", &names).expect("fields");
        let mut spec = ContractModel::builder(ArtifactKind::Spec);
        spec.set_layer(&ep, Layer::Spec, set.clone());
        let mut client = ContractModel::builder(ArtifactKind::Client);
        client.set_layer(&ep, Layer::Client, set.clone());
        let mut server = ContractModel::builder(ArtifactKind::Server);
        server.set_layer(&ep, Layer::Server, set);
        let out = compare(
            &spec.build().expect("spec"),
            &client.build().expect("client"),
            &server.build().expect("server"),
        )
        .expect("compare");
        prop_assert!(out.mismatches.is_empty());
    }
}
