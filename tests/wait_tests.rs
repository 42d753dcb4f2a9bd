
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use batch_lite::error::BatchError;
use batch_lite::wait::{
    CallFuture, CallKey, CallOutput, CallStatus, CallStore, FutureWaitEngine, JobMonitor,
    MemoryStore, MemoryStoreProvider, MonitoredJob, ReturnWhen, StorageMonitor, TracingProgress,
    WaitOptions,
};
use test_harness::{assert_eventually, fast_wait_config};

const BACKEND: &str = "memory";

fn key(job_id: &str, call_id: &str) -> CallKey {
    CallKey::new("exec", job_id, call_id)
}

fn futures_for(job_id: &str, n: usize) -> Vec<CallFuture> {
    (0..n)
        .map(|i| CallFuture::new(key(job_id, &format!("{:05}", i)), BACKEND))
        .collect()
}

fn watched(job_id: &str, call_ids: &[&str]) -> MonitoredJob {
    MonitoredJob {
        executor_id: "exec".to_string(),
        job_id: job_id.to_string(),
        call_ids: call_ids.iter().map(|c| c.to_string()).collect(),
    }
}

fn opts() -> WaitOptions {
    WaitOptions::from_config(&fast_wait_config())
}

async fn setup() -> (FutureWaitEngine, Arc<MemoryStore>, Arc<MemoryStoreProvider>) {
    let provider = Arc::new(MemoryStoreProvider::new());
    let store = provider.store(BACKEND).await;
    let engine = FutureWaitEngine::new(provider.clone()).with_config(fast_wait_config());
    (engine, store, provider)
}

/// Complete `key` with `value` after `delay`.
fn complete_later(store: &Arc<MemoryStore>, key: CallKey, value: Value, delay: Duration) {
    let store = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        store.complete(key, value).await;
    });
}

/// Monitor wrapper that counts how often each job was started.
struct CountingMonitor {
    inner: StorageMonitor,
    starts: Mutex<HashMap<String, usize>>,
}

impl CountingMonitor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StorageMonitor::new(Duration::from_millis(5)),
            starts: Mutex::new(HashMap::new()),
        })
    }

    fn starts(&self, job_key: &str) -> usize {
        self.starts.lock().unwrap().get(job_key).copied().unwrap_or(0)
    }
}

impl JobMonitor for CountingMonitor {
    fn start(&self, job: MonitoredJob, store: Arc<dyn CallStore>) {
        *self.starts.lock().unwrap().entry(job.job_key()).or_default() += 1;
        self.inner.start(job, store);
    }

    fn is_alive(&self, job_key: &str) -> bool {
        self.inner.is_alive(job_key)
    }

    fn observed(&self, job_key: &str) -> std::collections::HashSet<String> {
        self.inner.observed(job_key)
    }
}

#[tokio::test]
async fn test_any_completed_returns_immediately() {
    let (engine, _store, _) = setup().await;
    let mut futures = futures_for("A000", 2);
    futures[0].apply_status(CallStatus::success(), true).unwrap();

    let opts = opts().return_when(ReturnWhen::AnyCompleted);
    let outcome = tokio::time::timeout(Duration::from_millis(100), engine.wait(&mut futures, &opts))
        .await
        .expect("should not poll")
        .unwrap();

    assert_eq!(outcome.done.len(), 1);
    assert_eq!(outcome.done[0].key().call_id, "00000");
    assert_eq!(outcome.not_done.len(), 1);
    assert_eq!(outcome.not_done[0].key().call_id, "00001");
}

#[tokio::test]
async fn test_all_completed_waits_for_every_status() {
    let (engine, store, _) = setup().await;
    let mut futures = futures_for("A000", 3);
    for (i, delay) in [10u64, 30, 50].into_iter().enumerate() {
        complete_later(
            &store,
            key("A000", &format!("{:05}", i)),
            json!(i),
            Duration::from_millis(delay),
        );
    }

    let outcome = engine.wait(&mut futures, &opts()).await.unwrap();
    assert_eq!(outcome.done.len(), 3);
    assert!(outcome.not_done.is_empty());
    assert!(outcome.done.iter().all(|f| f.is_ready()));
    // Status only: results are not downloaded
    assert!(outcome.done.iter().all(|f| !f.is_done()));
}

#[tokio::test]
async fn test_any_completed_returns_after_first_status() {
    let (engine, store, _) = setup().await;
    let mut futures = futures_for("A000", 3);
    complete_later(&store, key("A000", "00001"), json!(1), Duration::from_millis(10));

    let opts = opts().return_when(ReturnWhen::AnyCompleted);
    let outcome = engine.wait(&mut futures, &opts).await.unwrap();
    assert_eq!(outcome.done.len(), 1);
    assert_eq!(outcome.done[0].key().call_id, "00001");
    assert_eq!(outcome.not_done.len(), 2);
}

#[tokio::test]
async fn test_get_result_preserves_wait_set_order() {
    let (engine, store, _) = setup().await;
    let mut futures = futures_for("A000", 4);
    for i in (0..4).rev() {
        complete_later(
            &store,
            key("A000", &format!("{:05}", i)),
            json!(format!("result-{}", i)),
            Duration::from_millis(5 * (4 - i as u64)),
        );
    }

    let results = engine.get_result(&mut futures, &opts()).await.unwrap();
    assert_eq!(
        results,
        vec![
            json!("result-0"),
            json!("result-1"),
            json!("result-2"),
            json!("result-3")
        ]
    );
    assert!(futures.iter().all(|f| f.is_done()));
}

#[tokio::test]
async fn test_children_extend_the_wait_set() {
    let (engine, store, _) = setup().await;
    let monitor = CountingMonitor::new();
    let engine = engine.with_monitor(monitor.clone());

    let mut futures = futures_for("A000", 1);
    monitor.start(watched("A000", &["00000"]), store.clone());

    let children = vec![key("A001", "00000"), key("A001", "00001")];
    store
        .put_result(key("A000", "00000"), CallOutput::Futures(children.clone()))
        .await;
    store.put_status(key("A000", "00000"), CallStatus::success()).await;
    complete_later(&store, children[0].clone(), json!("c0"), Duration::from_millis(30));
    complete_later(&store, children[1].clone(), json!("c1"), Duration::from_millis(40));

    let results = engine.get_result(&mut futures, &opts()).await.unwrap();

    assert_eq!(futures.len(), 3);
    assert_eq!(futures[0].children(), children.as_slice());
    assert_eq!(futures[1].key(), &children[0]);
    assert!(futures.iter().all(|f| f.is_done()));
    // The parent dispatched children, so only their values are collected
    assert_eq!(results, vec![json!("c0"), json!("c1")]);
    assert_eq!(monitor.starts("exec-A001"), 1);
}

#[tokio::test]
async fn test_growth_restarts_finished_monitor() {
    let (engine, store, _) = setup().await;
    let monitor = CountingMonitor::new();
    let engine = engine.with_monitor(monitor.clone());

    let mut futures = futures_for("A000", 1);
    let child = key("A000", "00001");
    store
        .put_result(key("A000", "00000"), CallOutput::Futures(vec![child.clone()]))
        .await;
    store.put_status(key("A000", "00000"), CallStatus::success()).await;

    monitor.start(watched("A000", &["00000"]), store.clone());
    assert_eventually(
        || async { !monitor.is_alive("exec-A000") },
        Duration::from_secs(1),
        "monitor should finish once its only call is observed",
    )
    .await;

    complete_later(&store, child, json!("child"), Duration::from_millis(20));
    let results = engine.get_result(&mut futures, &opts()).await.unwrap();

    assert_eq!(results, vec![json!("child")]);
    assert_eq!(monitor.starts("exec-A000"), 2);
}

#[tokio::test]
async fn test_timeout_is_reported_distinctly() {
    let (engine, _store, _) = setup().await;
    let mut futures = futures_for("A000", 2);

    let opts = opts().timeout(Duration::from_millis(50));
    let err = engine.wait(&mut futures, &opts).await.unwrap_err();
    assert!(matches!(err, BatchError::Timeout(d) if d == Duration::from_millis(50)));
}

#[tokio::test]
async fn test_cancel_reports_incomplete_count() {
    let (engine, store, _) = setup().await;
    let mut futures = futures_for("A000", 3);
    complete_later(&store, key("A000", "00000"), json!(0), Duration::from_millis(5));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        trigger.cancel();
    });

    let progress = Arc::new(TracingProgress::new());
    let engine = engine.with_progress(progress.clone());
    let opts = opts().cancel(cancel);
    let err = engine.wait(&mut futures, &opts).await.unwrap_err();

    assert!(matches!(err, BatchError::Cancelled { not_done: 2 }));
    assert!(progress.is_closed());
    // Partial progress stays on the futures
    assert!(futures[0].is_ready());
}

#[tokio::test]
async fn test_call_failure_raises_by_default() {
    let (engine, store, _) = setup().await;
    let mut futures = futures_for("A000", 2);
    store.complete(key("A000", "00000"), json!(0)).await;
    store
        .put_status(key("A000", "00001"), CallStatus::failure("division by zero"))
        .await;

    let err = engine.get_result(&mut futures, &opts()).await.unwrap_err();
    match err {
        BatchError::CallFailed { call, message } => {
            assert_eq!(call, "exec/A000/00001");
            assert_eq!(message, "division by zero");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_call_failure_is_captured_without_throw_except() {
    let (engine, store, _) = setup().await;
    let mut futures = futures_for("A000", 2);
    store.complete(key("A000", "00000"), json!("ok")).await;
    store
        .put_status(key("A000", "00001"), CallStatus::failure("boom"))
        .await;

    let opts = opts().throw_except(false);
    let results = engine.get_result(&mut futures, &opts).await.unwrap();
    assert_eq!(results, vec![json!("ok"), Value::Null]);
    assert!(futures[1].is_done());
    assert_eq!(futures[1].status().unwrap().error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_always_runs_a_single_pass() {
    let (engine, store, _) = setup().await;
    let monitor = Arc::new(StorageMonitor::new(Duration::from_millis(5)));
    let engine = engine.with_monitor(monitor.clone());

    store.complete(key("A000", "00000"), json!(0)).await;
    monitor.start(watched("A000", &["00000", "00001"]), store.clone());
    assert_eventually(
        || async { monitor.observed("exec-A000").contains("00000") },
        Duration::from_secs(1),
        "monitor should observe the finished call",
    )
    .await;

    let mut futures = futures_for("A000", 2);
    let opts = opts().return_when(ReturnWhen::Always).download_results(true);
    let outcome = tokio::time::timeout(Duration::from_millis(200), engine.wait(&mut futures, &opts))
        .await
        .expect("a single pass should not block")
        .unwrap();

    assert_eq!(outcome.done.len(), 1);
    assert_eq!(outcome.not_done.len(), 1);
}

#[tokio::test]
async fn test_always_sees_statuses_present_before_the_wait() {
    let (engine, store, _) = setup().await;
    store.complete(key("A000", "00001"), json!(1)).await;

    let mut futures = futures_for("A000", 2);
    let opts = opts().return_when(ReturnWhen::Always).download_results(true);
    let outcome = engine.wait(&mut futures, &opts).await.unwrap();

    assert_eq!(outcome.done.len(), 1);
    assert_eq!(outcome.done[0].key().call_id, "00001");
    assert_eq!(outcome.not_done.len(), 1);
}

#[tokio::test]
async fn test_storage_errors_propagate() {
    let (engine, store, _) = setup().await;
    let monitor = Arc::new(StorageMonitor::new(Duration::from_millis(5)));
    let engine = engine.with_monitor(monitor.clone());

    store.complete(key("A000", "00000"), json!(0)).await;
    monitor.start(watched("A000", &["00000"]), store.clone());
    assert_eventually(
        || async { !monitor.is_alive("exec-A000") },
        Duration::from_secs(1),
        "monitor should finish",
    )
    .await;

    store.set_unavailable(true);
    let mut futures = futures_for("A000", 1);
    let opts = opts().throw_except(false);
    let err = engine.wait(&mut futures, &opts).await.unwrap_err();
    assert!(matches!(err, BatchError::Storage(_)));
}

#[tokio::test]
async fn test_futures_from_other_backends_use_provider() {
    let (engine, store, provider) = setup().await;
    let engine = engine.with_store(store.clone());
    let other = provider.store("archive").await;

    let mut futures = vec![
        CallFuture::new(key("A000", "00000"), BACKEND),
        CallFuture::new(key("B000", "00000"), "archive"),
    ];
    store.complete(key("A000", "00000"), json!("local")).await;
    other.complete(key("B000", "00000"), json!("archived")).await;

    let results = engine.get_result(&mut futures, &opts()).await.unwrap();
    assert_eq!(results, vec![json!("local"), json!("archived")]);
}

#[tokio::test]
async fn test_calls_without_output_finish_on_status() {
    let (engine, store, _) = setup().await;
    let mut futures = vec![CallFuture::new(key("A000", "00000"), BACKEND).without_output()];
    store.put_status(key("A000", "00000"), CallStatus::success()).await;

    let results = engine.get_result(&mut futures, &opts()).await.unwrap();
    assert!(results.is_empty());
    assert!(futures[0].is_done());
}

#[tokio::test]
async fn test_done_set_only_grows() {
    let (engine, store, _) = setup().await;
    let mut futures = futures_for("A000", 3);
    complete_later(&store, key("A000", "00002"), json!(2), Duration::from_millis(5));

    let any = opts().return_when(ReturnWhen::AnyCompleted);
    let first: Vec<CallKey> = engine
        .wait(&mut futures, &any)
        .await
        .unwrap()
        .done
        .iter()
        .map(|f| f.key().clone())
        .collect();

    store.complete(key("A000", "00000"), json!(0)).await;
    store.complete(key("A000", "00001"), json!(1)).await;
    let all: Vec<CallKey> = engine
        .wait(&mut futures, &opts())
        .await
        .unwrap()
        .done
        .iter()
        .map(|f| f.key().clone())
        .collect();

    assert!(first.iter().all(|k| all.contains(k)));
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_progress_tracks_completions() {
    let (engine, store, _) = setup().await;
    let progress = Arc::new(TracingProgress::new());
    let engine = engine.with_progress(progress.clone());

    let mut futures = futures_for("A000", 3);
    futures[0].apply_status(CallStatus::success(), true).unwrap();
    store.complete(key("A000", "00001"), json!(1)).await;
    store.complete(key("A000", "00002"), json!(2)).await;

    engine.wait(&mut futures, &opts()).await.unwrap();
    assert_eq!(progress.snapshot(), (3, 3));
    assert!(progress.is_closed());
}

#[tokio::test]
async fn test_empty_wait_set() {
    let (engine, _, _) = setup().await;
    let mut futures: Vec<CallFuture> = Vec::new();
    let outcome = engine.wait(&mut futures, &opts()).await.unwrap();
    assert!(outcome.done.is_empty() && outcome.not_done.is_empty());
}
