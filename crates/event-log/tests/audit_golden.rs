use bid_core::{BidSource, Platform, RejectReason};
use event_log::{AuditOutcome, BidAuditRecord, EventRecord, JsonlEventLog};
use serde_json::Value;

#[test]
fn golden_audit_lines_parse_as_typed_records() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), include_str!("golden/audit_sample.jsonl")).unwrap();
    let log = JsonlEventLog::open(tmp.path()).unwrap();

    let got: Vec<EventRecord<BidAuditRecord>> = log.read_all().unwrap();
    assert_eq!(got.len(), 3);
    assert_eq!(got[0].payload.platform, Platform::GoogleAds);
    assert_eq!(got[0].payload.source, Some(BidSource::Ai));
    assert_eq!(got[1].payload.final_amount, 90.0);
    assert_eq!(got[1].payload.breaker_state, "open");
    assert_eq!(got[2].payload.outcome, AuditOutcome::Rejected);
    assert_eq!(got[2].payload.reason, Some(RejectReason::BudgetExceeded));
}

#[test]
fn typed_records_are_readable_as_plain_json() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), include_str!("golden/audit_sample.jsonl")).unwrap();
    let log = JsonlEventLog::open(tmp.path()).unwrap();

    let got: Vec<EventRecord<Value>> = log.read_range(2, 4).unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].payload.get("platform").and_then(|v| v.as_str()), Some("tiktok"));
    assert_eq!(got[1].payload.get("reason").and_then(|v| v.as_str()), Some("budget_exceeded"));
}
