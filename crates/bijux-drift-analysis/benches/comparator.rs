use bijux_drift_analysis::{compare, similarity};
use bijux_drift_model::{
    ArtifactKind, ContractModel, Endpoint, FieldSet, HttpMethod, IssueId, IssueRecord, Layer,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn fragment(kind: ArtifactKind, layer: Layer, drop_every: usize) -> ContractModel {
    let mut builder = ContractModel::builder(kind);
    for n in 0..200 {
        let ep = Endpoint::new(HttpMethod::Post, &format!("/resource{n}/{{id}}"));
        let names = (0..12)
            .filter(|f| drop_every == 0 || f % drop_every != 0)
            .map(|f| format!("field_{f}"))
            .collect::<Vec<_>>();
        builder.set_layer(&ep, layer, FieldSet::from_names("bench", &names).expect("fields"));
    }
    builder.build().expect("model")
}

fn bench_compare(c: &mut Criterion) {
    let spec = fragment(ArtifactKind::Spec, Layer::Spec, 0);
    let client = fragment(ArtifactKind::Client, Layer::Client, 5);
    let server = fragment(ArtifactKind::Server, Layer::Server, 0);

    c.bench_function("compare_200_endpoints", |b| {
        b.iter(|| compare(black_box(&spec), black_box(&client), black_box(&server)).expect("compare"))
    });
}

fn bench_similarity(c: &mut Criterion) {
    let mut a = IssueRecord::new(
        IssueId::from_sequence(1),
        1,
        "Backend Auth",
        "token refresh returns 401 after session rotation on the login endpoint",
    );
    let mut b = IssueRecord::new(
        IssueId::from_sequence(2),
        2,
        "backend auth",
        "login endpoint returns 401 when the refresh token rotates",
    );
    a.files.insert("src/auth/session.rs".to_string());
    b.files.insert("./src/auth/session.rs".to_string());

    c.bench_function("issue_similarity", |bench| {
        bench.iter(|| similarity(black_box(&a), black_box(&b)))
    });
}

criterion_group!(benches, bench_compare, bench_similarity);
criterion_main!(benches);
