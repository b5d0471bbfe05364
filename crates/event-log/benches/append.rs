use bid_core::{BidRequest, BidResponse, Platform};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use event_log::{BidAuditRecord, JsonlEventLog};

fn sample() -> BidAuditRecord {
    let req = BidRequest::new("cust", "camp", Platform::GoogleAds, 500.0, 25.0);
    let resp = BidResponse::ai("ref-1", 25.0, 1);
    BidAuditRecord::from_outcome(&req, &resp, "closed", 1, 12)
}

fn bench_append(c: &mut Criterion) {
    let rec = sample();
    c.bench_function("append_audit_record", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let log = JsonlEventLog::open(dir.path().join("audit.jsonl")).unwrap();
                (dir, log)
            },
            |(_dir, log)| {
                let _ = log.append(1, 1, &rec);
            },
            BatchSize::SmallInput,
        )
    });
    c.bench_function("append_batch_64", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let log = JsonlEventLog::open(dir.path().join("audit.jsonl")).unwrap();
                (dir, log)
            },
            |(_dir, log)| {
                let _ = log.append_batch((0..64u64).map(|i| (i, 1, &rec)));
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
