use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tandem_collab::channel::Channel;
use tandem_collab::doc::ServerDoc;
use tandem_collab::protocol::Message;
use tandem_collab::storage::query::evaluate;
use tandem_collab::storage::{MemoryStorage, StoredDoc};
use tandem_core::{diff_ids, Clock, Document, Mutator, VersionVector};

fn sample_op() -> tandem_core::Op {
    let mut doc = Document::new("notes", "n1");
    let mut clock = Clock::new("bench");
    let mut m = Mutator::new(&mut doc, &mut clock);
    m.set(Some("title"), json!("a reasonably short title")).unwrap().remove(0)
}

fn bench_op_encode(c: &mut Criterion) {
    let op = sample_op();
    c.bench_function("op_message_encode", |b| {
        b.iter(|| {
            let msg = Message::from_op(black_box(&op)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_op_decode(c: &mut Criterion) {
    let encoded = Message::from_op(&sample_op()).unwrap().encode().unwrap();
    c.bench_function("op_message_decode", |b| {
        b.iter(|| {
            let msg = Message::decode(black_box(&encoded)).unwrap();
            black_box(msg.to_op().unwrap());
        })
    });
}

fn bench_query_evaluate(c: &mut Criterion) {
    let docs: Vec<StoredDoc> = (0..1_000)
        .map(|i| StoredDoc {
            id: format!("d{i:04}"),
            state: Some(json!({"done": i % 3 == 0, "rank": i % 97})),
            ops: Vec::new(),
            version: VersionVector::new(),
        })
        .collect();
    let expression = json!({"done": false, "$orderby": {"rank": -1}, "$limit": 50});

    c.bench_function("query_evaluate_1K_docs", |b| {
        b.iter(|| black_box(evaluate(black_box(&expression), docs.clone())))
    });
}

fn bench_id_diff(c: &mut Criterion) {
    let old: Vec<String> = (0..500).map(|i| format!("id{i}")).collect();
    let mut new = old.clone();
    new.remove(100);
    new.insert(250, "fresh".to_string());
    new.swap(10, 400);

    c.bench_function("query_id_diff_500", |b| {
        b.iter(|| black_box(diff_ids(black_box(&old), black_box(&new))))
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let doc = ServerDoc::new(
        "notes",
        "n1",
        Arc::new(MemoryStorage::new()),
        Duration::from_secs(60),
    );
    let mut receivers = Vec::new();
    rt.block_on(async {
        doc.load().await.unwrap();
        for _ in 0..100 {
            let (channel, rx) = Channel::pair();
            doc.subscribe(channel, None, None, None).await;
            receivers.push(rx);
        }
    });
    let mut clock = Clock::new("bench");
    let mut local = Document::new("notes", "n1");

    c.bench_function("fan_out_op_100_channels", |b| {
        b.iter(|| {
            let op = Mutator::new(&mut local, &mut clock)
                .increment("views", 1.0)
                .unwrap()
                .remove(0);
            rt.block_on(doc.apply_op(op, None, false));
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_op_encode,
    bench_op_decode,
    bench_query_evaluate,
    bench_id_diff,
    bench_fan_out,
);
criterion_main!(benches);
