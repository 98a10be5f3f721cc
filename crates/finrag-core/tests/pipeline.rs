mod support;

use finrag_bucket::{MemoryBucketStore, Operation};
use finrag_core::frames::{column_names, schema_of};
use finrag_core::pipeline::{log_record, MergePipeline};
use finrag_core::run_log::{parse_log, MergeType, RunStatus};
use polars::prelude::*;
use support::{
    config, historical_frame, ids, incremental_frame, read, sentence_for, store_with, FINAL_KEY,
    HISTORICAL_KEY, INCREMENTAL_KEY, LOG_KEY,
};

fn pipeline(store: &std::sync::Arc<MemoryBucketStore>) -> MergePipeline {
    MergePipeline::new(config(), store.clone())
}

fn archives(store: &MemoryBucketStore) -> Vec<String> {
    store
        .keys()
        .into_iter()
        .filter(|key| key.starts_with("data/archive/"))
        .collect()
}

#[tokio::test]
async fn bootstrap_merges_historical_and_incremental() {
    let historical = historical_frame(&[
        ("1", "320193", "Apple Inc.", 2022, "a"),
        ("2", "320193", "Apple Inc.", 2022, "b"),
        ("3", "789019", "Microsoft Corp", 2023, "c"),
    ]);
    let incremental = incremental_frame(&[
        ("3", "789019", "Microsoft Corp", 2023, "c'"),
        ("4", "789019", "Microsoft Corp", 2024, "d"),
    ]);
    let store = store_with(&[(HISTORICAL_KEY, &historical), (INCREMENTAL_KEY, &incremental)]);

    let outcome = pipeline(&store).run().await;

    assert!(outcome.succeeded(), "run failed: {:?}", outcome.error);
    assert_eq!(outcome.stats.merge_type, MergeType::InitialBootstrap);
    assert_eq!(outcome.stats.base_rows, 3);
    assert_eq!(outcome.stats.incr_rows, 2);
    assert_eq!(outcome.stats.final_rows, 4);
    assert_eq!(outcome.stats.duplicates_removed, 1);
    assert!(outcome.archive.is_none());
    assert!(archives(&store).is_empty());

    let published = read(&store, FINAL_KEY);
    assert_eq!(ids(&published), vec!["1", "2", "3", "4"]);
    assert_eq!(sentence_for(&published, "3"), "c'");
    assert_eq!(schema_of(&published), schema_of(&historical));

    let log = parse_log(&store.object(LOG_KEY).unwrap()).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, RunStatus::Success);
    assert_eq!(log[0].merge_type, MergeType::InitialBootstrap);
    assert_eq!(log[0].final_rows, 4);
    assert_eq!(log[0].companies, 2);
}

#[tokio::test]
async fn existing_final_is_archived_and_used_as_base() {
    let historical = historical_frame(&[("h", "1", "A", 2020, "historical only")]);
    let final_table = historical_frame(&[
        ("1", "1", "A", 2021, "a"),
        ("2", "1", "A", 2021, "b"),
    ]);
    let incremental = incremental_frame(&[("2", "1", "A", 2021, "b'")]);
    let store = store_with(&[
        (HISTORICAL_KEY, &historical),
        (INCREMENTAL_KEY, &incremental),
        (FINAL_KEY, &final_table),
    ]);
    let previous_final = store.object(FINAL_KEY).unwrap();

    let outcome = pipeline(&store).run().await;

    assert!(outcome.succeeded(), "run failed: {:?}", outcome.error);
    assert_eq!(outcome.stats.merge_type, MergeType::IncrementalUpdate);
    assert_eq!(outcome.stats.base_key.as_deref(), Some(FINAL_KEY));

    let archived = archives(&store);
    assert_eq!(archived.len(), 1);
    assert_eq!(store.object(&archived[0]).unwrap(), previous_final);

    let published = read(&store, FINAL_KEY);
    assert_eq!(ids(&published), vec!["1", "2"]);
    assert_eq!(sentence_for(&published, "2"), "b'");
}

#[tokio::test]
async fn rerunning_the_same_incremental_is_stable() {
    let historical = historical_frame(&[("1", "1", "A", 2020, "a")]);
    let incremental = incremental_frame(&[
        ("1", "1", "A", 2020, "a'"),
        ("2", "1", "A", 2021, "b"),
    ]);
    let store = store_with(&[(HISTORICAL_KEY, &historical), (INCREMENTAL_KEY, &incremental)]);

    assert!(pipeline(&store).run().await.succeeded());
    let first = read(&store, FINAL_KEY);
    let second_outcome = pipeline(&store).run().await;
    assert!(second_outcome.succeeded());
    let second = read(&store, FINAL_KEY);

    assert_eq!(second_outcome.stats.merge_type, MergeType::IncrementalUpdate);
    assert_eq!(second_outcome.stats.duplicates_removed, 2);
    assert!(first.equals_missing(&second));
    assert_eq!(parse_log(&store.object(LOG_KEY).unwrap()).unwrap().len(), 2);
}

#[tokio::test]
async fn failed_preflight_writes_nothing() {
    let historical = historical_frame(&[("1", "1", "A", 2020, "a")]);
    let store = store_with(&[(HISTORICAL_KEY, &historical)]);

    let outcome = pipeline(&store).run().await;

    assert!(!outcome.succeeded());
    assert!(outcome.error.is_some());
    assert!(outcome.log.is_none());
    assert_eq!(store.mutation_count(), 0);
    assert!(!store.contains(FINAL_KEY));
    assert!(!store.contains(LOG_KEY));
}

#[tokio::test]
async fn schema_failure_is_logged_and_final_untouched() {
    let mut final_table = historical_frame(&[("1", "1", "A", 2021, "a")]);
    final_table
        .with_column(Series::new("market_cap".into(), vec![3.5f64]))
        .unwrap();
    let historical = historical_frame(&[("h", "1", "A", 2020, "h")]);
    let incremental = incremental_frame(&[("2", "1", "A", 2021, "b")]);
    let store = store_with(&[
        (HISTORICAL_KEY, &historical),
        (INCREMENTAL_KEY, &incremental),
        (FINAL_KEY, &final_table),
    ]);
    let previous_final = store.object(FINAL_KEY).unwrap();

    let outcome = pipeline(&store).run().await;

    assert!(!outcome.succeeded());
    assert!(outcome.error.as_deref().unwrap().contains("market_cap"));
    assert_eq!(store.object(FINAL_KEY).unwrap(), previous_final);

    let log = parse_log(&store.object(LOG_KEY).unwrap()).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, RunStatus::Failed);
    assert_eq!(log[0].merge_type, MergeType::IncrementalUpdate);
    assert!(log[0].error.contains("market_cap"));
}

#[tokio::test]
async fn upload_failure_marks_the_run_failed() {
    let historical = historical_frame(&[("1", "1", "A", 2020, "a")]);
    let incremental = incremental_frame(&[("2", "1", "A", 2021, "b")]);
    let store = store_with(&[(HISTORICAL_KEY, &historical), (INCREMENTAL_KEY, &incremental)]);
    store.fail_operation(Operation::Put);

    let outcome = pipeline(&store).run().await;

    assert!(!outcome.succeeded());
    assert!(!store.contains(FINAL_KEY));
    assert!(outcome.log.as_ref().and_then(|log| log.warning()).is_some());
    assert_eq!(outcome.warnings.len(), 1);
}

#[tokio::test]
async fn corrupt_log_does_not_fail_a_good_merge() {
    let historical = historical_frame(&[("1", "1", "A", 2020, "a")]);
    let incremental = incremental_frame(&[("2", "1", "A", 2021, "b")]);
    let store = store_with(&[(HISTORICAL_KEY, &historical), (INCREMENTAL_KEY, &incremental)]);
    store.insert(LOG_KEY, "when,what\nyesterday,something\n");

    let outcome = pipeline(&store).run().await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(store.object(LOG_KEY).unwrap().as_ref(), b"when,what\nyesterday,something\n");
    assert_eq!(column_names(&read(&store, FINAL_KEY)), column_names(&historical));
}

#[tokio::test]
async fn log_record_reflects_the_outcome() {
    let historical = historical_frame(&[("1", "1", "A", 2020, "a")]);
    let store = store_with(&[(HISTORICAL_KEY, &historical)]);
    let outcome = pipeline(&store).run().await;

    let finished = chrono::Utc::now();
    let record = log_record(&outcome, finished);

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.merge_type, MergeType::Unknown);
    assert_eq!(record.final_rows, 0);
    assert_eq!(
        record.timestamp,
        finished.format("%Y-%m-%d %H:%M:%S").to_string()
    );
    assert!(!record.error.is_empty());
}
