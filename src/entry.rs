//! Process entry actions.
//!
//! A pod is started as `batch-lite <action> <base64 payload>`; each action
//! wires the configured components together and runs until its work is done
//! or the shutdown token fires.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{ListenerConfig, MasterConfig, PullConfig};
use crate::dispatch::broker::FanoutBroker;
use crate::dispatch::fanout::{FanoutScheduler, ListenerStats};
use crate::dispatch::pull::{HttpRangeSource, PullSummary, PullWorker};
use crate::dispatch::server::{self, MasterState};
use crate::error::Result;
use crate::job::JobPayload;
use crate::worker::FunctionHandler;

/// Actions understood by the binary.
pub const ACTIONS: [&str; 4] = ["run-job", "run-master", "start-listener", "get-metadata"];

/// Pull ranges of `payload` from the master and execute them until the job
/// is exhausted.
pub async fn run_job(
    payload: &JobPayload,
    config: &PullConfig,
    handler: Arc<dyn FunctionHandler>,
    shutdown: &CancellationToken,
) -> Result<PullSummary> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        master_url = %config.master_url,
        "Starting pull worker"
    );
    let source = Arc::new(HttpRangeSource::new(config.master_url.clone()));
    let worker = PullWorker::new(source, handler, config);
    worker.run_job(payload, shutdown).await
}

/// Serve range allocations until shutdown.
pub async fn run_master(config: &MasterConfig, shutdown: CancellationToken) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        "Starting master"
    );
    server::run_master(config, MasterState::default(), shutdown).await
}

/// Consume job messages for this pod until shutdown.
pub async fn start_listener(
    config: &ListenerConfig,
    broker: &dyn FanoutBroker,
    handler: Arc<dyn FunctionHandler>,
    shutdown: &CancellationToken,
) -> Result<ListenerStats> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %config.queue_name,
        range_start = config.range_start,
        range_end = config.range_end,
        num_cpus_cluster = config.num_cpus_cluster,
        "Starting fanout listener"
    );
    let scheduler = FanoutScheduler::new(config, handler);
    scheduler.start_listening(broker, shutdown).await
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeMetadata {
    pub name: &'static str,
    pub version: &'static str,
    pub actions: Vec<&'static str>,
}

pub fn runtime_metadata() -> RuntimeMetadata {
    RuntimeMetadata {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        actions: ACTIONS.to_vec(),
    }
}
