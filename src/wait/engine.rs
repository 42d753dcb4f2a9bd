use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::WaitConfig;
use crate::error::{BatchError, Result};
use crate::wait::future::{CallFuture, CallKey, CallOutput, CallStatus};
use crate::wait::monitor::{JobMonitor, MonitoredJob, StorageMonitor};
use crate::wait::progress::ProgressSink;
use crate::wait::store::{CallStore, StoreProvider};

/// When a wait returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnWhen {
    /// Every future is complete
    #[default]
    AllCompleted,
    /// At least one future is complete
    AnyCompleted,
    /// After exactly one polling pass
    Always,
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Wait for results (`done`) instead of statuses (`ready` or `done`)
    pub download_results: bool,
    pub return_when: ReturnWhen,
    /// Raise the first call failure instead of capturing it on the future
    pub throw_except: bool,
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub pool_size: usize,
    pub cancel: Option<CancellationToken>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::from_config(&WaitConfig::default())
    }
}

impl WaitOptions {
    pub fn from_config(config: &WaitConfig) -> Self {
        Self {
            download_results: false,
            return_when: ReturnWhen::AllCompleted,
            throw_except: true,
            timeout: None,
            poll_interval: config.poll_interval,
            pool_size: config.pool_size,
            cancel: None,
        }
    }

    pub fn download_results(mut self, download_results: bool) -> Self {
        self.download_results = download_results;
        self
    }

    pub fn return_when(mut self, return_when: ReturnWhen) -> Self {
        self.return_when = return_when;
        self
    }

    pub fn throw_except(mut self, throw_except: bool) -> Self {
        self.throw_except = throw_except;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    async fn cancelled(&self) {
        match &self.cancel {
            Some(cancel) => cancel.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

/// Final partition of a wait set.
#[derive(Debug, Default)]
pub struct WaitOutcome<'a> {
    pub done: Vec<&'a CallFuture>,
    pub not_done: Vec<&'a CallFuture>,
}

impl<'a> WaitOutcome<'a> {
    fn partition(futures: &'a [CallFuture], download_results: bool) -> Self {
        let (done, not_done): (Vec<&CallFuture>, Vec<&CallFuture>) = futures
            .iter()
            .partition(|f| f.is_complete(download_results));
        Self { done, not_done }
    }
}

/// Futures of one job key polled together against one store.
struct JobUnit {
    executor_id: String,
    job_id: String,
    job_key: String,
    store: Arc<dyn CallStore>,
    members: Vec<usize>,
}

impl JobUnit {
    fn monitored(&self, futures: &[CallFuture]) -> MonitoredJob {
        MonitoredJob {
            executor_id: self.executor_id.clone(),
            job_id: self.job_id.clone(),
            call_ids: self
                .members
                .iter()
                .map(|&i| futures[i].key().call_id.clone())
                .collect(),
        }
    }
}

#[derive(Debug)]
enum Fetched {
    Status(Option<CallStatus>),
    Result {
        status: Option<CallStatus>,
        output: Option<CallOutput>,
    },
}

/// Tracks completion of call futures by polling their status/result store.
pub struct FutureWaitEngine {
    provider: Arc<dyn StoreProvider>,
    store: Option<Arc<dyn CallStore>>,
    monitor: Option<Arc<dyn JobMonitor>>,
    progress: Option<Arc<dyn ProgressSink>>,
    config: WaitConfig,
}

impl FutureWaitEngine {
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            provider,
            store: None,
            monitor: None,
            progress: None,
            config: WaitConfig::default(),
        }
    }

    /// Store reused for every job whose futures live in the same backend.
    pub fn with_store(mut self, store: Arc<dyn CallStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use an already running monitor instead of starting one per wait.
    pub fn with_monitor(mut self, monitor: Arc<dyn JobMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_config(mut self, config: WaitConfig) -> Self {
        self.config = config;
        self
    }

    /// Wait for `futures` according to `opts` and return them split into
    /// `(done, not_done)`.
    ///
    /// The set is updated in place and may grow: calls that dispatched further
    /// calls contribute child futures, appended at the end.
    pub async fn wait<'a>(
        &self,
        futures: &'a mut Vec<CallFuture>,
        opts: &WaitOptions,
    ) -> Result<WaitOutcome<'a>> {
        let download = opts.download_results;
        let Some(first) = futures.first() else {
            return Ok(WaitOutcome::default());
        };

        let executor_id = first.key().executor_id.clone();
        if download {
            tracing::info!(executor_id = %executor_id, "Getting results from functions");
        } else {
            tracing::info!(executor_id = %executor_id, "Waiting for functions to complete");
        }

        if futures.iter().any(|f| !f.is_complete(download)) {
            if let Some(progress) = &self.progress {
                progress.set_total(futures.len());
                progress.inc(futures.iter().filter(|f| f.is_complete(download)).count());
            }

            let polled = match opts.timeout {
                Some(limit) => {
                    tracing::debug!(timeout_secs = limit.as_secs(), "Setting waiting timeout");
                    match tokio::time::timeout(limit, self.poll(futures, opts)).await {
                        Ok(polled) => polled,
                        Err(_) => Err(BatchError::Timeout(limit)),
                    }
                }
                None => self.poll(futures, opts).await,
            };

            if let Some(progress) = &self.progress {
                progress.close();
            }
            polled?;
        }

        let futures: &'a Vec<CallFuture> = futures;
        Ok(WaitOutcome::partition(futures, download))
    }

    /// Wait for every result and collect the values of the futures that
    /// produce output and dispatched no children, in wait-set order.
    pub async fn get_result(
        &self,
        futures: &mut Vec<CallFuture>,
        opts: &WaitOptions,
    ) -> Result<Vec<Value>> {
        let opts = opts
            .clone()
            .download_results(true)
            .return_when(ReturnWhen::AllCompleted);

        let executor_id = futures.first().map(|f| f.key().executor_id.clone());
        let outcome = self.wait(futures, &opts).await?;

        let results = outcome
            .done
            .into_iter()
            .filter(|f| f.produce_output() && f.children().is_empty())
            .map(|f| f.result(opts.throw_except))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(executor_id = ?executor_id, results = results.len(), "Finished getting results");
        Ok(results)
    }

    async fn poll(&self, futures: &mut Vec<CallFuture>, opts: &WaitOptions) -> Result<()> {
        let mut units = self.create_units(futures).await?;

        let monitor: Arc<dyn JobMonitor> = match &self.monitor {
            Some(monitor) => Arc::clone(monitor),
            None => {
                let monitor = Arc::new(StorageMonitor::new(self.config.monitor_interval));
                for unit in &units {
                    let job = unit.monitored(futures);
                    monitor.sweep(&job, unit.store.as_ref()).await?;
                    monitor.start(job, Arc::clone(&unit.store));
                }
                monitor as Arc<dyn JobMonitor>
            }
        };

        if opts.return_when == ReturnWhen::Always {
            return self.pass(&mut units, futures, monitor.as_ref(), opts).await;
        }

        while !Self::condition_met(futures, opts) {
            if opts.is_cancelled() {
                return Err(Self::cancelled(futures, opts));
            }

            self.pass(&mut units, futures, monitor.as_ref(), opts).await?;
            if Self::condition_met(futures, opts) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(opts.poll_interval) => {}
                _ = opts.cancelled() => return Err(Self::cancelled(futures, opts)),
            }
        }
        Ok(())
    }

    fn condition_met(futures: &[CallFuture], opts: &WaitOptions) -> bool {
        let download = opts.download_results;
        match opts.return_when {
            ReturnWhen::AllCompleted => futures.iter().all(|f| f.is_complete(download)),
            ReturnWhen::AnyCompleted => futures.iter().any(|f| f.is_complete(download)),
            ReturnWhen::Always => true,
        }
    }

    fn cancelled(futures: &[CallFuture], opts: &WaitOptions) -> BatchError {
        let not_done = futures
            .iter()
            .filter(|f| !f.is_complete(opts.download_results))
            .count();
        tracing::info!("Cancelled - Total activations not done: {}", not_done);
        BatchError::Cancelled { not_done }
    }

    async fn create_units(&self, futures: &[CallFuture]) -> Result<Vec<JobUnit>> {
        let mut units: Vec<JobUnit> = Vec::new();
        for (index, future) in futures.iter().enumerate() {
            let job_key = future.job_key();
            match units.iter_mut().find(|u| u.job_key == job_key) {
                Some(unit) => unit.members.push(index),
                None => {
                    let mut unit = self.new_unit(future.key(), future.storage_backend()).await?;
                    unit.members.push(index);
                    units.push(unit);
                }
            }
        }
        Ok(units)
    }

    async fn new_unit(&self, key: &CallKey, backend: &str) -> Result<JobUnit> {
        let store = match &self.store {
            Some(store) if store.backend() == backend => Arc::clone(store),
            _ => self.provider.open(backend).await?,
        };
        Ok(JobUnit {
            executor_id: key.executor_id.clone(),
            job_id: key.job_id.clone(),
            job_key: key.job_key(),
            store,
            members: Vec::new(),
        })
    }

    /// One polling pass over every job unit. Units created for children
    /// during the pass are polled in the same pass.
    async fn pass(
        &self,
        units: &mut Vec<JobUnit>,
        futures: &mut Vec<CallFuture>,
        monitor: &dyn JobMonitor,
        opts: &WaitOptions,
    ) -> Result<()> {
        let mut index = 0;
        while index < units.len() {
            self.poll_unit(index, units, futures, monitor, opts).await?;
            index += 1;
        }
        Ok(())
    }

    async fn poll_unit(
        &self,
        unit_index: usize,
        units: &mut Vec<JobUnit>,
        futures: &mut Vec<CallFuture>,
        monitor: &dyn JobMonitor,
        opts: &WaitOptions,
    ) -> Result<()> {
        let download = opts.download_results;
        let unit = &units[unit_index];
        let observed = monitor.observed(&unit.job_key);

        let targets: Vec<(usize, CallKey, bool, bool)> = unit
            .members
            .iter()
            .copied()
            .filter(|&i| {
                let f = &futures[i];
                !f.is_complete(download) && observed.contains(&f.key().call_id)
            })
            .map(|i| {
                let f = &futures[i];
                (i, f.key().clone(), f.status().is_none(), f.produce_output())
            })
            .collect();

        if targets.is_empty() {
            return Ok(());
        }

        let store = Arc::clone(&unit.store);
        let mut fetched: Vec<(usize, Result<Fetched>)> = stream::iter(targets)
            .map(|(i, key, needs_status, wants_output)| {
                let store = Arc::clone(&store);
                async move {
                    let fetched = if download {
                        fetch_result(store.as_ref(), &key, needs_status, wants_output).await
                    } else {
                        store.fetch_status(&key).await.map(Fetched::Status)
                    };
                    (i, fetched)
                }
            })
            .buffer_unordered(opts.pool_size.max(1))
            .collect()
            .await;
        fetched.sort_by_key(|(i, _)| *i);

        let mut first_error: Option<BatchError> = None;
        let mut newly_complete = 0;
        let mut children: Vec<(CallKey, String)> = Vec::new();

        for (i, fetched) in fetched {
            let future = &mut futures[i];
            let was_complete = future.is_complete(download);
            let was_done = future.is_done();

            let applied = match fetched {
                Ok(fetched) => apply(future, fetched, opts.throw_except),
                Err(e) => Err(e),
            };
            if let Err(e) = applied {
                first_error.get_or_insert(e);
            }

            if !was_complete && future.is_complete(download) {
                newly_complete += 1;
            }
            if !was_done && future.is_done() {
                let backend = future.storage_backend().to_string();
                children.extend(future.children().iter().cloned().map(|c| (c, backend.clone())));
            }
        }

        if let Some(progress) = &self.progress {
            progress.inc(newly_complete);
        }

        if !children.is_empty() {
            self.grow(units, futures, monitor, children).await?;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Append child futures to the wait set and to the unit of their own job,
    /// then make sure every grown unit is being monitored.
    async fn grow(
        &self,
        units: &mut Vec<JobUnit>,
        futures: &mut Vec<CallFuture>,
        monitor: &dyn JobMonitor,
        children: Vec<(CallKey, String)>,
    ) -> Result<()> {
        let added = children.len();
        let mut grown: Vec<usize> = Vec::new();

        for (key, backend) in children {
            let job_key = key.job_key();
            let unit_index = match units.iter().position(|u| u.job_key == job_key) {
                Some(unit_index) => unit_index,
                None => {
                    units.push(self.new_unit(&key, &backend).await?);
                    units.len() - 1
                }
            };

            futures.push(CallFuture::new(key, backend));
            units[unit_index].members.push(futures.len() - 1);
            if !grown.contains(&unit_index) {
                grown.push(unit_index);
            }
        }

        tracing::debug!(added, total = futures.len(), "Wait set grew");
        if let Some(progress) = &self.progress {
            progress.set_total(futures.len());
        }

        for unit_index in grown {
            let unit = &units[unit_index];
            if !monitor.is_alive(&unit.job_key) {
                tracing::debug!(job_key = %unit.job_key, "Restarting job monitor");
            }
            monitor.start(unit.monitored(futures), Arc::clone(&unit.store));
        }
        Ok(())
    }
}

async fn fetch_result(
    store: &dyn CallStore,
    key: &CallKey,
    needs_status: bool,
    wants_output: bool,
) -> Result<Fetched> {
    let status = if needs_status {
        match store.fetch_status(key).await? {
            Some(status) => Some(status),
            None => {
                return Ok(Fetched::Result {
                    status: None,
                    output: None,
                })
            }
        }
    } else {
        None
    };

    let failed = status.as_ref().is_some_and(|s| !s.success);
    let output = if wants_output && !failed {
        store.fetch_result(key).await?
    } else {
        None
    };
    Ok(Fetched::Result { status, output })
}

fn apply(future: &mut CallFuture, fetched: Fetched, throw_except: bool) -> Result<()> {
    match fetched {
        Fetched::Status(Some(status)) => future.apply_status(status, throw_except),
        Fetched::Status(None) => Ok(()),
        Fetched::Result { status, output } => {
            if let Some(status) = status {
                future.apply_status(status, throw_except)?;
            }
            if let Some(output) = output {
                if !future.is_done() {
                    future.apply_output(output);
                }
            }
            Ok(())
        }
    }
}
