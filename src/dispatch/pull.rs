use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::config::PullConfig;
use crate::dispatch::allocator::RangeAllocator;
use crate::dispatch::range::RangeSpec;
use crate::error::{BatchError, Result};
use crate::job::{new_activation_id, JobPayload};
use crate::worker::{FunctionHandler, InvocationStatus};

/// Where a pull worker gets its next range from.
#[async_trait]
pub trait RangeSource: Send + Sync {
    async fn next_range(
        &self,
        job_key: &str,
        total_calls: u64,
        chunk_size: u64,
    ) -> Result<RangeSpec>;
}

/// Range source backed by the master's HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRangeSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// `{base}/get-range/{job_key}/{total}/{chunk}`, with every segment
    /// percent-encoded.
    pub fn range_url(&self, job_key: &str, total_calls: u64, chunk_size: u64) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            BatchError::InvalidArgument(format!("master url {}: {}", self.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                BatchError::InvalidArgument(format!("master url {} cannot have a path", self.base_url))
            })?
            .pop_if_empty()
            .extend([
                "get-range",
                job_key,
                total_calls.to_string().as_str(),
                chunk_size.to_string().as_str(),
            ]);
        Ok(url)
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn next_range(
        &self,
        job_key: &str,
        total_calls: u64,
        chunk_size: u64,
    ) -> Result<RangeSpec> {
        let url = self.range_url(job_key, total_calls, chunk_size)?;
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        body.parse()
    }
}

#[async_trait]
impl RangeSource for RangeAllocator {
    async fn next_range(
        &self,
        job_key: &str,
        total_calls: u64,
        chunk_size: u64,
    ) -> Result<RangeSpec> {
        self.get_range(job_key, total_calls, chunk_size).await
    }
}

/// What one worker executed for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub rounds: usize,
    pub calls: usize,
    pub failed_rounds: usize,
}

/// Worker loop of the pull model: request a range, run it, repeat until the
/// master answers with the sentinel.
pub struct PullWorker {
    source: Arc<dyn RangeSource>,
    handler: Arc<dyn FunctionHandler>,
    retry_delay: Duration,
}

impl PullWorker {
    pub fn new(
        source: Arc<dyn RangeSource>,
        handler: Arc<dyn FunctionHandler>,
        config: &PullConfig,
    ) -> Self {
        Self {
            source,
            handler,
            retry_delay: config.retry_delay,
        }
    }

    /// Consume ranges of `payload` until none are left.
    ///
    /// Each range is executed synchronously under a fresh activation id before
    /// the next one is requested.
    pub async fn run_job(
        &self,
        payload: &JobPayload,
        cancel: &CancellationToken,
    ) -> Result<PullSummary> {
        let job_key = payload.job_key();
        let total_calls = payload.total_calls as u64;
        let chunk_size = payload.effective_chunksize() as u64;

        tracing::info!(job_key = %job_key, total_calls, chunk_size, "Starting pull execution");

        let mut summary = PullSummary::default();
        loop {
            let range = self
                .request_range(&job_key, total_calls, chunk_size, cancel)
                .await?;
            tracing::info!(job_key = %job_key, range = %range, "Received range");

            let (start, end) = match range {
                RangeSpec::Exhausted => break,
                RangeSpec::Span { start, end } => (start as usize, end as usize),
            };

            let activation_id = new_activation_id();
            let window = payload
                .window(start, end)?
                .with_activation_id(activation_id.clone());

            let report = self.handler.handle(window).await;
            if report.status == InvocationStatus::Failed {
                summary.failed_rounds += 1;
                tracing::warn!(
                    job_key = %job_key,
                    activation_id = %activation_id,
                    range = %range,
                    error = ?report.error,
                    "Range execution failed"
                );
            }

            summary.rounds += 1;
            summary.calls += end - start;
        }

        tracing::info!(
            job_key = %job_key,
            rounds = summary.rounds,
            calls = summary.calls,
            "Finishing pull execution"
        );
        Ok(summary)
    }

    /// Ask for a range, retrying transient failures after a fixed delay for as
    /// long as it takes.
    async fn request_range(
        &self,
        job_key: &str,
        total_calls: u64,
        chunk_size: u64,
        cancel: &CancellationToken,
    ) -> Result<RangeSpec> {
        let mut attempt: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(BatchError::Shutdown);
            }

            match self.source.next_range(job_key, total_calls, chunk_size).await {
                Ok(range) => return Ok(range),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    tracing::debug!(job_key, attempt, error = %e, "Range request failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = cancel.cancelled() => return Err(BatchError::Shutdown),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
