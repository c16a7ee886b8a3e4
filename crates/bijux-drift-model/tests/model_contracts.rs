// SPDX-License-Identifier: Apache-2.0

use bijux_drift_model::{
    ArtifactKind, ContractModel, Endpoint, EndpointKey, FieldSet, HttpMethod, IssueId,
    IssueRecord, Layer, ModelError, RunReportDraft, RunId, RunState,
};
use proptest::prelude::*;

#[test]
fn endpoint_without_layers_is_rejected() {
    let mut builder = ContractModel::builder(ArtifactKind::Server);
    builder.declare(&Endpoint::new(HttpMethod::Get, "/orphan"));
    assert!(matches!(builder.build(), Err(ModelError::EmptyEndpoint(_))));
}

#[test]
fn one_populated_layer_is_enough() {
    let mut builder = ContractModel::builder(ArtifactKind::Server);
    let ep = Endpoint::new(HttpMethod::Get, "/health");
    builder.set_layer(&ep, Layer::Server, FieldSet::new("health"));
    let model = builder.build().expect("model");
    assert!(model.contains(&EndpointKey::new(HttpMethod::Get, "/health/")));
}

#[test]
fn report_serializes_with_schema_version() {
    let draft = RunReportDraft::new(RunId::parse("nightly").expect("id"), 1);
    let report = draft.finalize(2);
    let value = serde_json::to_value(&report).expect("encode");
    assert_eq!(value["schema_version"], 1);
    assert_eq!(value["final_state"], "collecting");
    assert_eq!(report.final_state, RunState::Collecting);
}

#[test]
fn issue_record_survives_json_storage() {
    let mut record = IssueRecord::new(IssueId::from_sequence(7), 7, "Backend Auth", "token expired");
    record.files.insert("src/auth.rs".to_string());
    record.potential_duplicates_of.insert(IssueId::from_sequence(3));
    let text = serde_json::to_string(&record).expect("encode");
    let back: IssueRecord = serde_json::from_str(&text).expect("decode");
    assert_eq!(back, record);
}

#[test]
fn invalid_method_is_reported() {
    assert_eq!(
        HttpMethod::parse("TRACE"),
        Err(ModelError::InvalidMethod("TRACE".to_string()))
    );
}

proptest! {
    #[test]
    fn symmetric_difference_is_symmetric(
        a in proptest::collection::btree_set("[a-z]{1,6}", 0..8),
        b in proptest::collection::btree_set("[a-z]{1,6}", 0..8),
    ) {
        let left = FieldSet::from_names("left", &a).expect("left");
        let right = FieldSet::from_names("right", &b).expect("right");
        prop_assert_eq!(left.symmetric_difference(&right), right.symmetric_difference(&left));
        prop_assert_eq!(left.symmetric_difference(&right).is_empty(), left == right);
    }

    #[test]
    fn normalized_templates_are_idempotent(segments in proptest::collection::vec("[a-z]{1,5}|\\{[a-z]{1,4}\\}|:[a-z]{1,4}", 0..5)) {
        let raw = format!("/{}", segments.join("/"));
        let once = bijux_drift_model::normalize_path_template(&raw);
        prop_assert_eq!(bijux_drift_model::normalize_path_template(&once), once.clone());
        prop_assert!(!once.contains(':'));
    }
}
