// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bijux_drift_analysis::{
    classify, compare, DuplicateGraph, EvidenceCollector, RealFs, RemediationPlanner,
    SourceTreeInspector,
};
use bijux_drift_extract::{extract_spec_text, ServerExtractor, ServerIndex};
use bijux_drift_model::{
    ArtifactKind, ClassificationKind, ContractModel, EndpointKey, Evidence, FixKind, HttpMethod,
    IssueId, IssueRecord, IssueStatus, LayerPair, Mismatch, MismatchKind,
};

const SPEC: &str = r#"
openapi: 3.0.0
paths:
  /reports:
    get:
      operationId: getReports
      responses:
        '200':
          content:
            application/json:
              schema:
                type: object
                properties:
                  total: { type: integer }
  /users:
    post:
      operationId: createUser
      requestBody:
        content:
          application/json:
            schema:
              type: object
              required: [email]
              properties:
                email: { type: string }
                nickname: { type: string }
      responses:
        '201':
          description: created
"#;

const ROUTER: &str = r#"use axum::{routing::get, Router};

pub fn app() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/reports", get(not_implemented))
}
"#;

const HANDLERS: &str = r#"use axum::{http::StatusCode, Json};

#[derive(Serialize)]
pub struct Report {
    pub total: u64,
}

#[derive(Deserialize)]
pub struct CreateUser {
    pub email: String,
    pub legacy: bool,
}

pub async fn get_reports() -> Json<Report> {
    Json(Report { total: 0 })
}

pub async fn create_user(Json(body): Json<CreateUser>) -> StatusCode {
    StatusCode::CREATED
}

pub async fn not_implemented() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}
"#;

fn write(root: &Path, rel: &str, text: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, text).expect("write");
}

fn server_tree(generated_at: Option<u64>) -> tempfile::TempDir {
    let tmp = tempfile::tempdir().expect("tempdir");
    write(tmp.path(), "src/router.rs", ROUTER);
    write(tmp.path(), "src/handlers.rs", HANDLERS);
    if let Some(at) = generated_at {
        write(
            tmp.path(),
            ".drift/generation.json",
            &format!(r#"{{"generated_at": {at}, "files": ["src/handlers.rs"]}}"#),
        );
    }
    tmp
}

fn server_mismatch<'a>(mismatches: &'a [Mismatch], path: &str, method: HttpMethod) -> &'a Mismatch {
    mismatches
        .iter()
        .find(|m| m.endpoint == EndpointKey::new(method, path) && m.pair == LayerPair::SpecServerRequest)
        .expect("server mismatch")
}

#[test]
fn placeholder_route_after_regeneration_is_a_restorable_tool_artifact() {
    // far-future marker: generation is newer than any edit in the tree
    let tmp = server_tree(Some(4_102_444_800));
    let extraction = ServerExtractor {
        root: tmp.path().to_path_buf(),
    }
    .extract_with_index()
    .expect("server");
    let spec = Arc::new(extract_spec_text(SPEC).expect("spec"));
    let comparison = compare(&spec, &ContractModel::empty(ArtifactKind::Client), &extraction.model)
        .expect("compare");

    let index = Arc::new(extraction.index);
    let collector = EvidenceCollector::new(Arc::new(SourceTreeInspector::new(
        Arc::clone(&index),
        Arc::new(RealFs),
        tmp.path(),
    )));
    let key = EndpointKey::new(HttpMethod::Get, "/reports");
    let mismatch = server_mismatch(&comparison.mismatches, "/reports", HttpMethod::Get);
    assert!(mismatch.endpoint_absent);

    let evidence = collector.collect(mismatch, spec.get(&key).map(|e| &e.endpoint));
    assert_eq!(evidence.handler_exists, Some(true));
    assert_eq!(evidence.routing_correct, Some(false));
    assert_eq!(evidence.recent_regeneration, Some(true));

    let classification = classify(mismatch, &evidence);
    assert_eq!(classification.kind, ClassificationKind::ToolArtifact);

    let planner = RemediationPlanner::new(Arc::clone(&index), Arc::clone(&spec));
    let fix = planner
        .plan(mismatch, &classification, &evidence)
        .expect("plan")
        .expect("fix");
    assert_eq!(fix.kind, FixKind::RestoreRoute);
    assert!(fix.safe);
    assert_eq!(fix.target, "src/router.rs");
    let patched = fix.apply_to(ROUTER).expect("apply");
    assert!(patched.contains("        .route(\"/reports\", get(get_reports))"));
    assert!(!patched.contains("not_implemented"));
    assert!(fix.verification.iter().all(|check| check.holds_for(&patched)));
}

#[test]
fn missing_route_plans_route_and_struct_alignment() {
    let tmp = server_tree(Some(4_102_444_800));
    let extraction = ServerExtractor {
        root: tmp.path().to_path_buf(),
    }
    .extract_with_index()
    .expect("server");
    let spec = Arc::new(extract_spec_text(SPEC).expect("spec"));
    let comparison = compare(&spec, &ContractModel::empty(ArtifactKind::Client), &extraction.model)
        .expect("compare");
    let index = Arc::new(extraction.index);
    let collector = EvidenceCollector::new(Arc::new(SourceTreeInspector::new(
        Arc::clone(&index),
        Arc::new(RealFs),
        tmp.path(),
    )));

    let rows = comparison
        .mismatches
        .iter()
        .map(|m| {
            let evidence = collector.collect(m, spec.get(&m.endpoint).map(|e| &e.endpoint));
            let classification = classify(m, &evidence);
            (m.clone(), classification, evidence)
        })
        .collect::<Vec<_>>();
    let fixes = RemediationPlanner::new(index, Arc::clone(&spec))
        .plan_all(&rows)
        .expect("plan");

    let kinds = fixes.iter().map(|f| f.kind).collect::<Vec<_>>();
    assert_eq!(kinds.iter().filter(|k| **k == FixKind::RestoreRoute).count(), 2);
    let add = fixes
        .iter()
        .find(|f| f.kind == FixKind::AddServerField)
        .expect("add field");
    let remove = fixes
        .iter()
        .find(|f| f.kind == FixKind::RemoveServerField)
        .expect("remove field");
    assert!(add.safe);
    assert!(!remove.safe);

    let added = add.apply_to(HANDLERS).expect("add");
    assert!(added.contains("pub struct CreateUser {\n    pub nickname: Option<serde_json::Value>,"));
    let removed = remove.apply_to(&added).expect("remove");
    assert!(!removed.contains("pub legacy: bool,"));
    assert!(remove.verification.iter().all(|check| check.holds_for(&removed)));
}

#[test]
fn missing_marker_leaves_regeneration_unknown() {
    let tmp = server_tree(None);
    let extraction = ServerExtractor {
        root: tmp.path().to_path_buf(),
    }
    .extract_with_index()
    .expect("server");
    let spec = extract_spec_text(SPEC).expect("spec");
    let comparison = compare(&spec, &ContractModel::empty(ArtifactKind::Client), &extraction.model)
        .expect("compare");
    let collector = EvidenceCollector::new(Arc::new(SourceTreeInspector::new(
        Arc::new(extraction.index),
        Arc::new(RealFs),
        tmp.path(),
    )));
    let mismatch = server_mismatch(&comparison.mismatches, "/reports", HttpMethod::Get);
    let evidence = collector.collect(mismatch, None);
    assert_eq!(evidence.recent_regeneration, None);
    assert!(evidence.trace_text().contains("no generation marker"));
    let classification = classify(mismatch, &evidence);
    assert_eq!(classification.kind, ClassificationKind::TrueRegression);
    assert!(classification.needs_manual_review);
}

fn bare_mismatch() -> Mismatch {
    Mismatch::new(
        EndpointKey::new(HttpMethod::Delete, "/sessions/{id}"),
        LayerPair::SpecServerRequest,
        MismatchKind::FieldMissing,
        Default::default(),
        Default::default(),
        Default::default(),
    )
    .expect("mismatch")
    .absent()
}

#[test]
fn scenario_b_broken_wiring_after_regeneration_is_tool_artifact() {
    let m = bare_mismatch();
    let mut ev = Evidence::new(m.id.clone());
    ev.handler_exists = Some(true);
    ev.routing_correct = Some(false);
    ev.recent_regeneration = Some(true);
    assert_eq!(classify(&m, &ev).kind, ClassificationKind::ToolArtifact);
}

#[test]
fn scenario_c_missing_handler_is_regression_without_fix() {
    let m = bare_mismatch();
    let mut ev = Evidence::new(m.id.clone());
    ev.handler_exists = Some(false);
    ev.recent_regeneration = Some(false);
    let classification = classify(&m, &ev);
    assert_eq!(classification.kind, ClassificationKind::TrueRegression);
    let planner = RemediationPlanner::new(
        Arc::new(ServerIndex::default()),
        Arc::new(ContractModel::empty(ArtifactKind::Spec)),
    );
    assert!(planner.plan(&m, &classification, &ev).expect("plan").is_none());
}

#[test]
fn routed_request_drift_is_a_test_artifact_left_unplanned() {
    let tmp = server_tree(Some(4_102_444_800));
    let extraction = ServerExtractor {
        root: tmp.path().to_path_buf(),
    }
    .extract_with_index()
    .expect("server");
    let spec = Arc::new(extract_spec_text(SPEC).expect("spec"));
    let index = Arc::new(extraction.index);
    let m = Mismatch::new(
        EndpointKey::new(HttpMethod::Post, "/users"),
        LayerPair::SpecServerRequest,
        MismatchKind::FieldMissing,
        Default::default(),
        Default::default(),
        Default::default(),
    )
    .expect("mismatch");
    let mut ev = Evidence::new(m.id.clone());
    ev.handler_exists = Some(true);
    ev.routing_correct = Some(true);
    ev.recent_regeneration = Some(true);
    let classification = classify(&m, &ev);
    assert_eq!(classification.kind, ClassificationKind::TestArtifact);
    let rows = vec![(m.clone(), classification.clone(), ev.clone())];
    let planner = RemediationPlanner::new(index, spec);
    assert!(planner.plan(&m, &classification, &ev).expect("plan").is_none());
    assert!(planner.plan_all(&rows).expect("plan").is_empty());
}

fn issue(seq: u64, component: &str, symptom: &str) -> IssueRecord {
    IssueRecord::new(IssueId::from_sequence(seq), seq * 1_000, component, symptom)
}

#[test]
fn scenario_d_overlapping_auth_reports_link_and_skip_later_ticket() {
    let first = issue(1, "Backend Auth", "login token expired refresh session");
    let later = issue(2, "Backend Auth", "login token expired refresh");
    let mut graph = DuplicateGraph::new([first, later]);
    let outcome = graph
        .link_if_similar(&IssueId::from_sequence(2), &IssueId::from_sequence(1))
        .expect("link")
        .expect("similar enough");
    assert_eq!(outcome.canonical, IssueId::from_sequence(1));
    let later = graph.get(&IssueId::from_sequence(2)).expect("later");
    assert!(later.is_linked_duplicate());
    assert!(!later.wants_ticket());
    assert!(graph.get(&IssueId::from_sequence(1)).expect("first").wants_ticket());
}

#[test]
fn chains_flatten_to_earliest_record() {
    let mut graph = DuplicateGraph::new([
        issue(1, "api", "crash saving invoice"),
        issue(2, "api", "crash saving invoice"),
        issue(3, "api", "crash saving invoice"),
    ]);
    graph
        .link(&IssueId::from_sequence(2), &IssueId::from_sequence(3))
        .expect("b-c");
    graph
        .link(&IssueId::from_sequence(1), &IssueId::from_sequence(2))
        .expect("a-b");
    let canonical = IssueId::from_sequence(1);
    for seq in [2, 3] {
        let id = IssueId::from_sequence(seq);
        assert_eq!(graph.canonical_of(&id), Some(canonical.clone()));
        let record = graph.get(&id).expect("record");
        assert!(record.duplicated_by.is_empty());
        assert_eq!(record.status, IssueStatus::Duplicate);
    }
    let original = graph.get(&canonical).expect("original");
    assert_eq!(original.duplicated_by.len(), 2);
    assert_eq!(original.status, IssueStatus::Untracked);
    graph.check_consistency().expect("consistent");
}
