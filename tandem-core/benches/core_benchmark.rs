use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use tandem_core::diff::{edit_script, string_edit};
use tandem_core::{Clock, Document, Mutator};

fn bench_string_typing(c: &mut Criterion) {
    c.bench_function("string_insert_1K_chars", |b| {
        b.iter(|| {
            let mut doc = Document::new("notes", "n1");
            let mut clock = Clock::new("bench");
            let mut m = Mutator::new(&mut doc, &mut clock);
            for i in 0..1_000 {
                m.insert_into_string("body", i, "x").unwrap();
            }
            black_box(doc.get(Some("body")));
        })
    });
}

fn bench_rebuild(c: &mut Criterion) {
    let mut doc = Document::new("stats", "s1");
    let mut clock = Clock::new("bench");
    {
        let mut m = Mutator::new(&mut doc, &mut clock);
        for i in 0..500 {
            m.increment("views", 1.0).unwrap();
            m.set(Some(&format!("f{}", i % 20)), json!(i)).unwrap();
        }
    }

    c.bench_function("distill_and_replay_1K_ops", |b| {
        b.iter(|| {
            let mut copy = doc.clone();
            copy.refresh_state();
            black_box(copy.get(None));
        })
    });
}

fn bench_array_diff(c: &mut Criterion) {
    let old: Vec<u32> = (0..300).collect();
    let mut new = old.clone();
    new.rotate_left(7);
    new.retain(|n| n % 13 != 0);

    c.bench_function("edit_script_300", |b| {
        b.iter(|| black_box(edit_script(black_box(&old), black_box(&new))))
    });
}

fn bench_string_edit(c: &mut Criterion) {
    let old = "lorem ipsum dolor sit amet ".repeat(40);
    let new = old.replacen("dolor", "color", 1);

    c.bench_function("string_edit_1K", |b| {
        b.iter(|| black_box(string_edit(black_box(&old), black_box(&new))))
    });
}

criterion_group!(
    benches,
    bench_string_typing,
    bench_rebuild,
    bench_array_diff,
    bench_string_edit,
);
criterion_main!(benches);
