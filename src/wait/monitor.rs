use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::Result;
use crate::wait::store::CallStore;

/// The calls of one job a monitor should watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredJob {
    pub executor_id: String,
    pub job_id: String,
    pub call_ids: Vec<String>,
}

impl MonitoredJob {
    pub fn job_key(&self) -> String {
        format!("{}-{}", self.executor_id, self.job_id)
    }
}

/// Watches jobs and reports which of their calls have a status available.
pub trait JobMonitor: Send + Sync {
    /// Start watching `job`. Starting an already watched job extends the set
    /// of calls it waits for.
    fn start(&self, job: MonitoredJob, store: Arc<dyn CallStore>);

    fn is_alive(&self, job_key: &str) -> bool;

    /// Call ids of `job_key` seen with a status so far.
    fn observed(&self, job_key: &str) -> HashSet<String>;
}

#[derive(Default)]
struct Watched {
    wanted: HashSet<String>,
    observed: HashSet<String>,
}

impl Watched {
    fn all_observed(&self) -> bool {
        self.wanted.is_subset(&self.observed)
    }
}

struct WatchEntry {
    state: Arc<Mutex<Watched>>,
    task: Option<JoinHandle<()>>,
}

/// Monitor that lists available statuses in the call store on a fixed
/// interval. One polling task per job; a task ends once every call it was
/// asked to watch has been observed. Tasks are aborted when the monitor is
/// dropped.
pub struct StorageMonitor {
    interval: Duration,
    jobs: Mutex<HashMap<String, WatchEntry>>,
}

impl StorageMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// List available statuses for `job` once, right now, and record them as
    /// observed. Does not start a polling task.
    pub async fn sweep(&self, job: &MonitoredJob, store: &dyn CallStore) -> Result<()> {
        let ready = store.ready_calls(&job.executor_id, &job.job_id).await?;
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = jobs.entry(job.job_key()).or_insert_with(|| WatchEntry {
            state: Arc::new(Mutex::new(Watched::default())),
            task: None,
        });
        entry
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observed
            .extend(ready);
        Ok(())
    }
}

impl JobMonitor for StorageMonitor {
    fn start(&self, job: MonitoredJob, store: Arc<dyn CallStore>) {
        let job_key = job.job_key();
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = jobs.entry(job_key.clone()).or_insert_with(|| WatchEntry {
            state: Arc::new(Mutex::new(Watched::default())),
            task: None,
        });

        entry
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .wanted
            .extend(job.call_ids.iter().cloned());

        if entry.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        tracing::debug!(job_key = %job_key, calls = job.call_ids.len(), "Starting storage monitor");
        let state = Arc::clone(&entry.state);
        let interval = self.interval;
        entry.task = Some(tokio::spawn(async move {
            loop {
                match store.ready_calls(&job.executor_id, &job.job_id).await {
                    Ok(ready) => {
                        let mut watched = state.lock().unwrap_or_else(PoisonError::into_inner);
                        watched.observed.extend(ready);
                        if watched.all_observed() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(job_key = %job_key, error = %e, "Storage monitor poll failed");
                    }
                }
                tokio::time::sleep(interval).await;
            }
            tracing::debug!(job_key = %job_key, "Storage monitor finished");
        }));
    }

    fn is_alive(&self, job_key: &str) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(job_key)
            .and_then(|entry| entry.task.as_ref())
            .is_some_and(|task| !task.is_finished())
    }

    fn observed(&self, job_key: &str) -> HashSet<String> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(job_key)
            .map(|entry| {
                entry
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .observed
                    .clone()
            })
            .unwrap_or_default()
    }
}

impl Drop for StorageMonitor {
    fn drop(&mut self) {
        let jobs = self.jobs.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in jobs.values() {
            if let Some(task) = &entry.task {
                task.abort();
            }
        }
    }
}
