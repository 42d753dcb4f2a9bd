
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use batch_lite::config::PullConfig;
use batch_lite::dispatch::{HttpRangeSource, PullWorker, RangeAllocator, RangeSource};
use batch_lite::error::BatchError;
use batch_lite::job::ByteRange;
use test_harness::{test_payload, FlakyRangeSource, RecordingHandler, RejectingRangeSource, TestMaster};

fn fast_pull_config() -> PullConfig {
    PullConfig::default().with_retry_delay(Duration::from_millis(5))
}

#[tokio::test]
async fn test_worker_runs_every_range_until_sentinel() {
    let source = Arc::new(RangeAllocator::new());
    let handler = RecordingHandler::new();
    let worker = PullWorker::new(source.clone(), handler.clone(), &fast_pull_config());

    let payload = test_payload("A000", 10, 3);
    let summary = worker
        .run_job(&payload, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.rounds, 4);
    assert_eq!(summary.calls, 10);
    assert_eq!(summary.failed_rounds, 0);

    let received = handler.received.lock().await;
    let windows: Vec<Vec<String>> = received.iter().map(|p| p.call_ids.clone()).collect();
    assert_eq!(windows[0], vec!["00000", "00001", "00002"]);
    assert_eq!(windows[3], vec!["00009"]);

    // Byte ranges follow the call ids of each window
    assert_eq!(
        received[1].data_byte_ranges,
        vec![ByteRange(300, 399), ByteRange(400, 499), ByteRange(500, 599)]
    );
}

#[tokio::test]
async fn test_each_round_gets_a_fresh_activation_id() {
    let source = Arc::new(RangeAllocator::new());
    let handler = RecordingHandler::new();
    let worker = PullWorker::new(source, handler.clone(), &fast_pull_config());

    worker
        .run_job(&test_payload("A000", 6, 2), &CancellationToken::new())
        .await
        .unwrap();

    let received = handler.received.lock().await;
    let ids: HashSet<String> = received
        .iter()
        .map(|p| p.activation_id.clone().unwrap())
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| id.len() == 12));
}

#[tokio::test]
async fn test_chunk_size_covers_worker_processes() {
    let source = Arc::new(RangeAllocator::new());
    let handler = RecordingHandler::new();
    let worker = PullWorker::new(source, handler.clone(), &fast_pull_config());

    let payload = test_payload("A000", 10, 1).with_worker_processes(4);
    let summary = worker.run_job(&payload, &CancellationToken::new()).await.unwrap();

    assert_eq!(summary.rounds, 3);
    let sizes: Vec<usize> = handler
        .received
        .lock()
        .await
        .iter()
        .map(|p| p.call_ids.len())
        .collect();
    assert_eq!(sizes, vec![4, 4, 2]);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let source = FlakyRangeSource::new(3);
    let handler = RecordingHandler::new();
    let worker = PullWorker::new(source.clone(), handler.clone(), &fast_pull_config());

    let summary = worker
        .run_job(&test_payload("A000", 4, 2), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.calls, 4);
    // 3 failures + 2 ranges + the sentinel
    assert_eq!(source.attempts.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let handler = RecordingHandler::new();
    let worker = PullWorker::new(
        Arc::new(RejectingRangeSource),
        handler.clone(),
        &fast_pull_config(),
    );

    let err = worker
        .run_job(&test_payload("A000", 4, 2), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::InvalidArgument(_)));
    assert!(handler.received.lock().await.is_empty());
}

#[tokio::test]
async fn test_failed_rounds_do_not_stop_the_loop() {
    let source = Arc::new(RangeAllocator::new());
    let handler = RecordingHandler::failing(&["00002"]);
    let worker = PullWorker::new(source, handler.clone(), &fast_pull_config());

    let summary = worker
        .run_job(&test_payload("A000", 6, 2), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.rounds, 3);
    assert_eq!(summary.failed_rounds, 1);
}

#[tokio::test]
async fn test_cancel_stops_retrying() {
    // Nothing listens on this port; every request fails with a connect error.
    let source = Arc::new(HttpRangeSource::new("http://127.0.0.1:9"));
    let worker = PullWorker::new(source, RecordingHandler::new(), &fast_pull_config());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        worker.run_job(&test_payload("A000", 4, 2), &cancel),
    )
    .await
    .expect("worker should stop on cancel");
    assert!(matches!(result, Err(BatchError::Shutdown)));
}

#[tokio::test]
async fn test_http_source_parses_master_responses() {
    let master = TestMaster::start().await;
    let source = HttpRangeSource::new(master.url());

    assert_eq!(
        source.range_url("exec-A000", 10, 3).unwrap().as_str(),
        format!("{}/get-range/exec-A000/10/3", master.url())
    );
    assert_eq!(source.next_range("exec-A000", 5, 3).await.unwrap().to_string(), "0-3");
    assert_eq!(source.next_range("exec-A000", 5, 3).await.unwrap().to_string(), "3-5");
    assert!(source.next_range("exec-A000", 5, 3).await.unwrap().is_exhausted());

    // A 400 from the master is a non-transient error
    let err = source.next_range("exec-A000", 5, 0).await.unwrap_err();
    assert!(!err.is_transient());

    master.stop().await;
}

#[tokio::test]
async fn test_job_keys_with_reserved_characters_reach_the_master() {
    let master = TestMaster::start().await;
    let source = HttpRangeSource::new(master.url());

    let url = source.range_url("exec/A?0#1", 5, 3).unwrap();
    assert!(url.as_str().ends_with("/get-range/exec%2FA%3F0%231/5/3"), "{}", url);

    assert_eq!(source.next_range("exec/A?0#1", 5, 3).await.unwrap().to_string(), "0-3");
    assert_eq!(source.next_range("exec/A?0#1", 5, 3).await.unwrap().to_string(), "3-5");

    let allocations = master.state.allocator.allocations().await;
    assert_eq!(allocations[0].job_key, "exec/A?0#1");

    master.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_several_workers_share_one_master() {
    let master = TestMaster::start().await;
    let payload = test_payload("A000", 50, 4);

    let handler = RecordingHandler::new();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let source = Arc::new(HttpRangeSource::new(master.url()));
        let worker = PullWorker::new(source, handler.clone(), &fast_pull_config());
        let payload = payload.clone();
        handles.push(tokio::spawn(async move {
            worker.run_job(&payload, &CancellationToken::new()).await
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap().unwrap().calls;
    }
    assert_eq!(total, 50);

    let ids = handler.call_ids().await;
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(ids.len(), 50);
    assert_eq!(unique.len(), 50);

    let allocations = master.state.allocator.allocations().await;
    assert_eq!(allocations[0].job_key, "exec-A000");
    assert_eq!(allocations[0].range_start, 50);

    master.stop().await;
}
