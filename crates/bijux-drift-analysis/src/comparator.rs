//! Three-way structural diff of contract fragments.

use std::collections::BTreeSet;

use bijux_drift_model::{
    ContractModel, EndpointKey, EndpointLayers, ExtractionFailure, FieldSet, LayerPair, Mismatch,
    MismatchKind, ModelError,
};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comparison {
    /// Sorted by (endpoint, pair).
    pub mismatches: Vec<Mismatch>,
    /// Extraction failures, plus pairs the server could not describe.
    /// Sorted by (endpoint, artifact).
    pub skipped: Vec<ExtractionFailure>,
}

fn request_kind(missing: &BTreeSet<String>, extra: &BTreeSet<String>) -> MismatchKind {
    if !missing.is_empty() {
        MismatchKind::FieldMissing
    } else if !extra.is_empty() {
        MismatchKind::FieldExtra
    } else {
        MismatchKind::TypeMismatch
    }
}

fn diff(key: &EndpointKey, pair: LayerPair, left: &FieldSet, right: &FieldSet) -> Result<Option<Mismatch>, ModelError> {
    let missing = left.missing_from(right);
    let extra = right.missing_from(left);
    let conflicts = left.type_conflicts(right);
    if missing.is_empty() && extra.is_empty() && conflicts.is_empty() {
        return Ok(None);
    }
    let kind = if pair.is_response() {
        MismatchKind::ResponseMismatch
    } else {
        request_kind(&missing, &extra)
    };
    Mismatch::new(key.clone(), pair, kind, missing, extra, conflicts).map(Some)
}

/// Endpoint declared by the spec but never seen in the fragment: one
/// `field_missing` carrying the whole spec request set.
fn absent_from_fragment(
    key: &EndpointKey,
    pair: LayerPair,
    spec_fields: &FieldSet,
) -> Result<Option<Mismatch>, ModelError> {
    if !pair.is_server() && spec_fields.is_empty() {
        return Ok(None);
    }
    let mismatch = Mismatch::new(
        key.clone(),
        pair,
        MismatchKind::FieldMissing,
        spec_fields.names(),
        BTreeSet::new(),
        BTreeSet::new(),
    )?;
    Ok(Some(mismatch.absent()))
}

/// Endpoint seen in the fragment but not declared by the spec.
fn undeclared(key: &EndpointKey, pair: LayerPair, observed: &FieldSet) -> Result<Option<Mismatch>, ModelError> {
    if pair.is_response() {
        if observed.is_empty() {
            return Ok(None);
        }
        return Mismatch::new(
            key.clone(),
            pair,
            MismatchKind::ResponseMismatch,
            BTreeSet::new(),
            observed.names(),
            BTreeSet::new(),
        )
        .map(Some);
    }
    let mismatch = Mismatch::new(
        key.clone(),
        pair,
        MismatchKind::FieldExtra,
        BTreeSet::new(),
        observed.names(),
        BTreeSet::new(),
    )?;
    Ok(Some(mismatch.absent()))
}

/// What one (endpoint, pair) comparison produced.
enum PairOutcome {
    Aligned,
    Drift(Mismatch),
    /// The fragment has the endpoint but could not describe this layer.
    Unextracted(ExtractionFailure),
}

fn layer_pair(
    key: &EndpointKey,
    pair: LayerPair,
    fragment: &ContractModel,
    declared: &EndpointLayers,
    observed: &EndpointLayers,
) -> Result<PairOutcome, ModelError> {
    let Some(left) = declared.layers.get(&pair.left()) else {
        debug!(endpoint = %key, pair = pair.as_str(), "spec layer not extracted; pair not compared");
        return Ok(PairOutcome::Aligned);
    };
    let empty = FieldSet::new(key.template.as_str());
    let right = match observed.layers.get(&pair.right()) {
        Some(right) => right,
        None if pair.is_server() => {
            return Ok(PairOutcome::Unextracted(ExtractionFailure {
                artifact: fragment.artifact,
                endpoint: key.clone(),
                location: None,
                reason: format!("{} fields not extracted; pair {} not compared", pair.right().as_str(), pair.as_str()),
            }));
        }
        None if pair.is_response() => {
            debug!(endpoint = %key, pair = pair.as_str(), "client reads no response fields; pair not compared");
            return Ok(PairOutcome::Aligned);
        }
        None => &empty,
    };
    Ok(diff(key, pair, left, right)?.map_or(PairOutcome::Aligned, PairOutcome::Drift))
}

fn compare_pair(
    key: &EndpointKey,
    pair: LayerPair,
    spec: &ContractModel,
    fragment: &ContractModel,
) -> Result<PairOutcome, ModelError> {
    let found = match (spec.get(key), fragment.get(key)) {
        (Some(declared), Some(observed)) => return layer_pair(key, pair, fragment, declared, observed),
        (Some(declared), None) if !pair.is_response() => {
            let empty = FieldSet::new(key.template.as_str());
            let left = declared.layers.get(&pair.left()).unwrap_or(&empty);
            absent_from_fragment(key, pair, left)?
        }
        (None, Some(observed)) => match observed.layers.get(&pair.right()) {
            Some(right) => undeclared(key, pair, right)?,
            None => None,
        },
        _ => None,
    };
    Ok(found.map_or(PairOutcome::Aligned, PairOutcome::Drift))
}

/// A failed endpoint only blinds the pairs that read the failed fragment:
/// a spec failure skips the endpoint, a client or server failure skips that
/// side's pairs and the other side is still compared.
pub fn compare(
    spec: &ContractModel,
    client: &ContractModel,
    server: &ContractModel,
) -> Result<Comparison, ModelError> {
    let mut skipped = spec
        .failures()
        .chain(client.failures())
        .chain(server.failures())
        .cloned()
        .collect::<Vec<_>>();

    let keys = spec
        .keys()
        .chain(client.keys())
        .chain(server.keys())
        .cloned()
        .collect::<BTreeSet<_>>();

    let mut mismatches = Vec::new();
    for key in keys.iter().filter(|key| !spec.is_failed(key)) {
        for pair in LayerPair::MATRIX {
            let fragment = if pair.is_server() { server } else { client };
            if fragment.is_failed(key) {
                continue;
            }
            match compare_pair(key, pair, spec, fragment)? {
                PairOutcome::Aligned => {}
                PairOutcome::Drift(mismatch) => {
                    debug!(endpoint = %key, pair = pair.as_str(), kind = mismatch.kind.as_str(), "mismatch");
                    mismatches.push(mismatch);
                }
                PairOutcome::Unextracted(failure) => {
                    debug!(endpoint = %key, pair = pair.as_str(), reason = %failure.reason, "pair skipped");
                    skipped.push(failure);
                }
            }
        }
    }
    skipped.sort_by(|a, b| (&a.endpoint, a.artifact).cmp(&(&b.endpoint, b.artifact)));
    Ok(Comparison { mismatches, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bijux_drift_model::{ArtifactKind, Endpoint, FieldSpec, HttpMethod, Layer};

    fn fragment(kind: ArtifactKind, entries: &[(&str, Layer, &[&str])]) -> ContractModel {
        let mut builder = ContractModel::builder(kind);
        for (path, layer, fields) in entries {
            let ep = Endpoint::new(HttpMethod::Post, path);
            builder.set_layer(&ep, *layer, FieldSet::from_names("f", *fields).expect("fields"));
        }
        builder.build().expect("model")
    }

    #[test]
    fn scenario_a_empty_client_body_is_one_field_missing() {
        let spec = fragment(ArtifactKind::Spec, &[("/x", Layer::Spec, &["a", "b", "c"])]);
        let client = fragment(ArtifactKind::Client, &[("/x", Layer::Client, &[])]);
        let server = fragment(ArtifactKind::Server, &[("/x", Layer::Server, &["a", "b", "c"])]);
        let out = compare(&spec, &client, &server).expect("compare");
        assert_eq!(out.mismatches.len(), 1);
        let m = &out.mismatches[0];
        assert_eq!(m.kind, MismatchKind::FieldMissing);
        assert_eq!(m.pair, LayerPair::SpecClientRequest);
        assert_eq!(m.difference.len(), 3);
    }

    #[test]
    fn absent_server_endpoint_is_reported_even_without_fields() {
        let spec = fragment(ArtifactKind::Spec, &[("/ping", Layer::Spec, &[])]);
        let client = ContractModel::empty(ArtifactKind::Client);
        let server = ContractModel::empty(ArtifactKind::Server);
        let out = compare(&spec, &client, &server).expect("compare");
        assert_eq!(out.mismatches.len(), 1);
        assert!(out.mismatches[0].endpoint_absent);
        assert_eq!(out.mismatches[0].pair, LayerPair::SpecServerRequest);
    }

    #[test]
    fn type_conflict_without_set_difference() {
        let ep = Endpoint::new(HttpMethod::Put, "/age");
        let mut spec = ContractModel::builder(ArtifactKind::Spec);
        let mut left = FieldSet::new("l");
        left.insert("age", FieldSpec::typed("integer", true)).expect("l");
        spec.set_layer(&ep, Layer::Spec, left);
        let mut server = ContractModel::builder(ArtifactKind::Server);
        let mut right = FieldSet::new("r");
        right.insert("age", FieldSpec::typed("string", true)).expect("r");
        server.set_layer(&ep, Layer::Server, right);
        let out = compare(
            &spec.build().expect("spec"),
            &ContractModel::empty(ArtifactKind::Client),
            &server.build().expect("server"),
        )
        .expect("compare");
        let server_side = out
            .mismatches
            .iter()
            .filter(|m| m.pair == LayerPair::SpecServerRequest)
            .collect::<Vec<_>>();
        assert_eq!(server_side.len(), 1);
        assert_eq!(server_side[0].kind, MismatchKind::TypeMismatch);
        assert!(server_side[0].difference.contains("age"));
    }

    #[test]
    fn client_failure_still_compares_the_server_side() {
        let spec = fragment(ArtifactKind::Spec, &[("/users", Layer::Spec, &["email", "name"])]);
        let mut client = ContractModel::builder(ArtifactKind::Client);
        client.mark_failed(&EndpointKey::new(HttpMethod::Post, "/users"), None, "request body is not an object literal");
        let server = fragment(ArtifactKind::Server, &[("/users", Layer::Server, &["email"])]);
        let out = compare(&spec, &client.build().expect("client"), &server).expect("compare");

        assert_eq!(out.mismatches.len(), 1);
        let m = &out.mismatches[0];
        assert_eq!(m.pair, LayerPair::SpecServerRequest);
        assert_eq!(m.kind, MismatchKind::FieldMissing);
        assert!(m.missing.contains("name"));
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].artifact, ArtifactKind::Client);
    }

    #[test]
    fn spec_failure_skips_every_pair_of_the_endpoint() {
        let mut spec = ContractModel::builder(ArtifactKind::Spec);
        spec.mark_failed(&EndpointKey::new(HttpMethod::Post, "/x"), None, "unresolvable $ref");
        let client = fragment(ArtifactKind::Client, &[("/x", Layer::Client, &["a"])]);
        let server = fragment(ArtifactKind::Server, &[("/x", Layer::Server, &["b"])]);
        let out = compare(&spec.build().expect("spec"), &client, &server).expect("compare");
        assert!(out.mismatches.is_empty());
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].artifact, ArtifactKind::Spec);
    }

    #[test]
    fn undescribed_server_layer_is_reported_not_passed() {
        let ep = Endpoint::new(HttpMethod::Get, "/report");
        let mut spec = ContractModel::builder(ArtifactKind::Spec);
        spec.set_layer(&ep, Layer::Spec, FieldSet::new("req"));
        spec.set_layer(&ep, Layer::ResponseSpec, FieldSet::from_names("resp", &["total"]).expect("resp"));
        let mut server = ContractModel::builder(ArtifactKind::Server);
        server.set_layer(&ep, Layer::Server, FieldSet::new("req"));
        let out = compare(
            &spec.build().expect("spec"),
            &ContractModel::empty(ArtifactKind::Client),
            &server.build().expect("server"),
        )
        .expect("compare");

        assert!(out
            .mismatches
            .iter()
            .all(|m| m.pair != LayerPair::SpecServerResponse));
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].artifact, ArtifactKind::Server);
        assert!(out.skipped[0].reason.contains("spec_server_response"));
    }

    #[test]
    fn undeclared_server_endpoint_is_field_extra() {
        let spec = ContractModel::empty(ArtifactKind::Spec);
        let server = fragment(ArtifactKind::Server, &[("/hidden", Layer::Server, &["token"])]);
        let out = compare(&spec, &ContractModel::empty(ArtifactKind::Client), &server)
            .expect("compare");
        assert_eq!(out.mismatches.len(), 1);
        assert_eq!(out.mismatches[0].kind, MismatchKind::FieldExtra);
        assert!(out.mismatches[0].extra.contains("token"));
    }
}
