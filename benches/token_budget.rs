//! Benchmarks for token accounting and prompt truncation.
//!
//! Every orchestrated call counts tokens for both prompts and may truncate
//! the user prompt, so these sit on the request hot path.

// Criterion macros generate items without docs - this is expected for benchmarks
#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;

use tutorlog::llm::tokens::{count_tokens, truncate_context};
use tutorlog::llm::prompts::extract_json_from_response;

const MODEL: &str = "gpt-4o";

const FENCED_REPLY: &str = "Here is the summary:\n```json\n{\"summary\": \"Covered limits.\", \
    \"open_questions\": [\"Why epsilon?\"]}\n```\nLet me know if you need more.";

fn transcript(words: usize) -> String {
    "the derivative measures instantaneous change ".repeat(words / 5 + 1)
}

fn bench_count_tokens(c: &mut Criterion) {
    let mut group = c.benchmark_group("count_tokens");
    group.measurement_time(Duration::from_secs(5));

    for words in [100, 1_000, 10_000] {
        let text = transcript(words);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(words), &text, |b, text| {
            b.iter(|| count_tokens(black_box(text), MODEL));
        });
    }

    group.finish();
}

fn bench_truncate_context(c: &mut Criterion) {
    let mut group = c.benchmark_group("truncate_context");
    let text = transcript(50_000);

    // Within budget: returns a copy
    group.bench_function("within_budget", |b| {
        b.iter(|| truncate_context(black_box(&text), usize::MAX, MODEL));
    });

    for budget in [512, 4_000, 32_000] {
        group.bench_with_input(BenchmarkId::new("over_budget", budget), &budget, |b, &budget| {
            b.iter(|| truncate_context(black_box(&text), budget, MODEL));
        });
    }

    group.finish();
}

fn bench_extract_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_json");

    group.bench_function("fenced", |b| {
        b.iter(|| extract_json_from_response(black_box(FENCED_REPLY)));
    });

    group.bench_function("bare", |b| {
        b.iter(|| extract_json_from_response(black_box("{\"summary\": \"x\"}")));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_count_tokens,
    bench_truncate_context,
    bench_extract_json
);
criterion_main!(benches);
