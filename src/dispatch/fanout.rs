use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::dispatch::broker::FanoutBroker;
use crate::dispatch::partition::{launch_schedule, plan, requested_cpus, CpuRange};
use crate::dispatch::slots::SlotCounter;
use crate::error::{BatchError, Result};
use crate::job::{new_activation_id, JobPayload};
use crate::worker::{FunctionHandler, InvocationStatus};

/// What a pod did with one job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSummary {
    /// The pod's CPU range lies entirely past the job's last call
    Skipped,
    Launched {
        launched: usize,
        total_executions: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub handled: usize,
    pub dropped: usize,
}

/// Push-model scheduler running on every pod.
///
/// Each job message is broadcast to all pods; every pod works out its own
/// share from its CPU range and launches exactly those calls, never running
/// more than one call per owned CPU at a time.
pub struct FanoutScheduler {
    range: CpuRange,
    num_cpus_cluster: usize,
    exchange: String,
    queue_name: String,
    handler: Arc<dyn FunctionHandler>,
    slots: Arc<SlotCounter>,
}

impl FanoutScheduler {
    pub fn new(config: &ListenerConfig, handler: Arc<dyn FunctionHandler>) -> Self {
        let range = CpuRange::new(config.range_start, config.range_end);
        Self {
            range,
            num_cpus_cluster: config.num_cpus_cluster,
            exchange: config.exchange.clone(),
            queue_name: config.queue_name.clone(),
            handler,
            slots: SlotCounter::new(range.cpus()),
        }
    }

    pub fn slots(&self) -> &Arc<SlotCounter> {
        &self.slots
    }

    /// Handle one job message: compute this pod's share and launch it.
    ///
    /// Returns once every call has been launched, not when they finish. Each
    /// launch waits for a free slot first; cancelling `cancel` stops launching
    /// and returns [`BatchError::Shutdown`]. Calls already running are left
    /// to finish.
    pub async fn on_job_message(
        &self,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<DispatchSummary> {
        let payload: JobPayload = serde_json::from_slice(body)?;
        let job_key = payload.job_key();
        let total_calls = payload.total_calls;

        let Some(requested) = requested_cpus(self.range, total_calls) else {
            tracing::debug!(job_key = %job_key, total_calls, "No calls for this pod");
            return Ok(DispatchSummary::Skipped);
        };

        let share = plan(
            self.num_cpus_cluster,
            self.range.cpus(),
            self.range,
            total_calls,
        )?;
        let schedule = launch_schedule(self.num_cpus_cluster, self.range, total_calls)?;

        tracing::info!(
            job_key = %job_key,
            total_calls,
            total_executions = share.pod_executions,
            processes = requested.min(self.range.cpus()),
            "Starting pod execution"
        );

        let mut launched = 0;
        for &index in &schedule {
            let call = payload.for_call(index)?.with_activation_id(new_activation_id());
            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(job_key = %job_key, launched, "Shutdown requested, no further calls launched");
                    return Err(BatchError::Shutdown);
                }
                slot = self.slots.acquire() => slot?,
            };
            let handler = Arc::clone(&self.handler);

            tokio::spawn(async move {
                let _slot = slot;
                let report = handler.handle(call).await;
                if report.status == InvocationStatus::Failed {
                    tracing::warn!(
                        job_key = %report.job_key,
                        call_ids = ?report.call_ids,
                        error = ?report.error,
                        "Call execution failed"
                    );
                }
            });
            launched += 1;
        }

        tracing::info!(job_key = %job_key, launched, "All calls launched");
        Ok(DispatchSummary::Launched {
            launched,
            total_executions: share.pod_executions,
        })
    }

    /// Consume job messages from this pod's queue until cancelled or the
    /// broker goes away.
    ///
    /// A message that fails to dispatch is logged and dropped; the listener
    /// keeps going.
    pub async fn start_listening(
        &self,
        broker: &dyn FanoutBroker,
        cancel: &CancellationToken,
    ) -> Result<ListenerStats> {
        let mut subscription = broker.subscribe(&self.exchange, &self.queue_name).await?;
        tracing::info!(
            exchange = %self.exchange,
            queue = %subscription.queue(),
            range_start = self.range.start,
            range_end = self.range.end,
            "Listening for job messages"
        );

        let mut stats = ListenerStats::default();
        loop {
            let body = tokio::select! {
                msg = subscription.next_message() => match msg {
                    Some(body) => body,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            match self.on_job_message(&body, cancel).await {
                Ok(summary) => {
                    stats.handled += 1;
                    tracing::debug!(?summary, "Job message handled");
                }
                Err(BatchError::Shutdown) => break,
                Err(e) => {
                    stats.dropped += 1;
                    tracing::warn!(error = %e, "Dropping job message (best-effort dispatch)");
                }
            }
        }

        tracing::info!(handled = stats.handled, dropped = stats.dropped, "Listener stopped");
        Ok(stats)
    }
}
