use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use tabletop_sync::{SessionAction, SessionManager, SyncConfig, SyncMessage};

// Baseline costs of the hot path: envelope decoding and the admission
// pipeline itself (lock, apply, commit) without any socket in the way.

fn envelope_decoding_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol");
    let raw = serde_json::json!({
        "id": "a1",
        "type": "action",
        "sessionId": "bench-table",
        "userId": "alice",
        "data": {"type": "move", "payload": {"resourceId": "tok1", "x": 3, "y": 4}},
        "timestamp": "2025-04-01T12:00:00Z",
    })
    .to_string();
    group.throughput(Throughput::Bytes(raw.len() as u64));

    group.bench_function("decode_action_envelope", |b| {
        b.iter(|| SyncMessage::from_json(&raw).unwrap().to_action().unwrap())
    });

    group.finish();
}

fn admission_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("admission");
    group.throughput(Throughput::Elements(1));

    group.bench_function("accept_action", |b| {
        let manager = Arc::new(SessionManager::new(SyncConfig::default()));
        rt.block_on(async {
            manager.create_session("bench-table").await;
        });
        let mut sequence = 0u64;
        b.to_async(&rt).iter(|| {
            sequence += 1;
            let action = SessionAction {
                id: format!("a{sequence}"),
                action_type: "move".to_string(),
                user_id: "alice".to_string(),
                session_id: "bench-table".to_string(),
                payload: serde_json::json!({
                    "resourceId": format!("tok{}", sequence % 16),
                    "x": sequence,
                }),
                timestamp: Utc::now(),
                version: 0,
            };
            let manager = Arc::clone(&manager);
            async move { manager.submit_action(action).await.unwrap() }
        })
    });

    group.finish();
}

criterion_group!(benches, envelope_decoding_benchmark, admission_benchmark);
criterion_main!(benches);
