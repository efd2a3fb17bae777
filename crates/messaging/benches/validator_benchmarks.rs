use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use courier_messaging::{MessageValidator, QueueContract};
use serde_json::json;

fn sample_bodies() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("ping", serde_json::to_vec(&json!({"kind": "ping"})).unwrap()),
        (
            "create-hash",
            serde_json::to_vec(&json!({"kind": "create-hash", "data": {"password": "abc123456789"}}))
                .unwrap(),
        ),
        (
            "closed-world-reject",
            serde_json::to_vec(&json!({
                "kind": "create-hash",
                "data": {"password": "abc123456789", "role": "admin"}
            }))
            .unwrap(),
        ),
        ("garbage", b"{\"kind\": \"create-hash\", \"data\": {".to_vec()),
    ]
}

fn bench_parse_and_validate(c: &mut Criterion) {
    let validator = MessageValidator::new();
    let contract = QueueContract::hash();

    let mut group = c.benchmark_group("validate");
    for (label, body) in sample_bodies() {
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &body, |b, body| {
            b.iter(|| {
                let parsed = validator.parse(black_box(body));
                black_box(parsed.map(|env| validator.validate(&env, &contract)))
            })
        });
    }
    group.finish();
}

fn bench_nested_safety_scan(c: &mut Criterion) {
    let validator = MessageValidator::new();
    let mut group = c.benchmark_group("parse_nested");

    for depth in [8usize, 32, 96] {
        let mut data = json!({"leaf": true});
        for _ in 0..depth {
            data = json!({"child": data, "siblings": [1, 2, 3]});
        }
        let body = serde_json::to_vec(&json!({"kind": "ping", "data": data})).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(depth), &body, |b, body| {
            b.iter(|| black_box(validator.parse(black_box(body))))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse_and_validate, bench_nested_safety_scan);
criterion_main!(benches);
