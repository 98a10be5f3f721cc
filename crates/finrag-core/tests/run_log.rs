use std::sync::Arc;

use finrag_bucket::{MemoryBucketStore, Operation};
use finrag_core::run_log::{
    parse_log, render_log, LogOutcome, MergeType, RunLogRecord, RunLogger, RunStatus,
};

const LOG_KEY: &str = "logs/merge_history.csv";

fn record(timestamp: &str, status: RunStatus) -> RunLogRecord {
    RunLogRecord {
        timestamp: timestamp.to_string(),
        status,
        merge_type: MergeType::IncrementalUpdate,
        base_rows: 10,
        incr_rows: 3,
        final_rows: 12,
        duplicates_removed: 1,
        companies: 2,
        year_min: 2019,
        year_max: 2024,
        size_mb: 0.5,
        duration_sec: 1.25,
        error: String::new(),
    }
}

#[test]
fn rendered_log_has_the_expected_header() {
    let body = render_log(&[record("2025-01-01 00:00:00", RunStatus::Success)]).unwrap();
    let text = String::from_utf8(body).unwrap();
    let mut lines = text.lines();

    assert_eq!(
        lines.next(),
        Some("timestamp,status,merge_type,base_rows,incr_rows,final_rows,duplicates_removed,companies,year_min,year_max,size_mb,duration_sec,error")
    );
    assert_eq!(
        lines.next(),
        Some("2025-01-01 00:00:00,SUCCESS,incremental_update,10,3,12,1,2,2019,2024,0.5,1.25,")
    );
}

#[test]
fn parse_reads_failed_runs() {
    let text = "timestamp,status,merge_type,base_rows,incr_rows,final_rows,duplicates_removed,companies,year_min,year_max,size_mb,duration_sec,error\n\
                2025-01-01 00:00:00,FAILED,unknown,0,0,0,0,0,0,0,0.0,0.1,boom\n";

    let records = parse_log(text.as_bytes()).unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RunStatus::Failed);
    assert_eq!(records[0].merge_type, MergeType::Unknown);
    assert_eq!(records[0].base_rows, 0);
    assert_eq!(records[0].error, "boom");
}

#[tokio::test]
async fn first_append_creates_the_log() {
    let store = Arc::new(MemoryBucketStore::new("finrag-test"));
    let logger = RunLogger::new(store.clone(), LOG_KEY);

    let outcome = logger
        .append(&record("2025-01-01 00:00:00", RunStatus::Success))
        .await;

    assert_eq!(
        outcome,
        LogOutcome::Written {
            key: LOG_KEY.to_string(),
            records: 1
        }
    );
    assert!(store.contains(LOG_KEY));
}

#[tokio::test]
async fn later_appends_keep_history() {
    let store = Arc::new(MemoryBucketStore::new("finrag-test"));
    let logger = RunLogger::new(store.clone(), LOG_KEY);

    logger
        .append(&record("2025-01-01 00:00:00", RunStatus::Success))
        .await;
    logger
        .append(&record("2025-01-02 00:00:00", RunStatus::Failed))
        .await;

    let records = parse_log(&store.object(LOG_KEY).unwrap()).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].timestamp, "2025-01-01 00:00:00");
    assert_eq!(records[1].status, RunStatus::Failed);
}

#[tokio::test]
async fn unreadable_log_is_left_untouched() {
    let store = Arc::new(MemoryBucketStore::new("finrag-test"));
    store.insert(LOG_KEY, "when,what\nyesterday,something\n");
    let logger = RunLogger::new(store.clone(), LOG_KEY);

    let outcome = logger
        .append(&record("2025-01-01 00:00:00", RunStatus::Success))
        .await;

    assert!(outcome.warning().is_some());
    assert_eq!(
        store.object(LOG_KEY).unwrap().as_ref(),
        b"when,what\nyesterday,something\n"
    );
    assert_eq!(store.mutation_count(), 0);
}

#[tokio::test]
async fn upload_failure_is_only_a_warning() {
    let store = Arc::new(MemoryBucketStore::new("finrag-test"));
    store.fail_operation(Operation::Put);
    let logger = RunLogger::new(store.clone(), LOG_KEY);

    let outcome = logger
        .append(&record("2025-01-01 00:00:00", RunStatus::Success))
        .await;

    assert!(matches!(outcome, LogOutcome::Warning { .. }));
    assert!(!store.contains(LOG_KEY));
}
