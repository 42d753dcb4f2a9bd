use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::dispatch::range::RangeSpec;
use crate::error::{BatchError, Result};

/// Allocation cursor of one job: the next index not yet handed out.
#[derive(Debug)]
struct AllocationState {
    cursor: AtomicU64,
    first_request_at: DateTime<Utc>,
}

impl AllocationState {
    fn new() -> Self {
        Self {
            cursor: AtomicU64::new(0),
            first_request_at: Utc::now(),
        }
    }
}

/// Snapshot of one job's allocation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationView {
    pub job_key: String,
    pub range_start: u64,
    pub first_request_at: DateTime<Utc>,
}

/// Hands out non-overlapping contiguous ranges of call indices per job key.
///
/// State lives for the lifetime of the process. Each job key has its own
/// atomic cursor, so concurrent requests for one key are serialized by a
/// compare-and-swap while requests for different keys never contend beyond
/// the map lookup.
#[derive(Debug, Default)]
pub struct RangeAllocator {
    jobs: RwLock<HashMap<String, Arc<AllocationState>>>,
}

impl RangeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next `[start, min(start + chunk_size, total_calls))` for `job_key`.
    ///
    /// Returns [`RangeSpec::Exhausted`] once every index below `total_calls`
    /// has been handed out, and for jobs with no calls at all.
    pub async fn get_range(
        &self,
        job_key: &str,
        total_calls: u64,
        chunk_size: u64,
    ) -> Result<RangeSpec> {
        if chunk_size == 0 {
            return Err(BatchError::InvalidArgument(
                "chunk_size must be > 0".to_string(),
            ));
        }

        let state = self.state_for(job_key).await;
        let end_for = |start: u64| start.saturating_add(chunk_size).min(total_calls);

        let range = match state
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |start| {
                (start < total_calls).then(|| end_for(start))
            }) {
            Ok(start) => RangeSpec::Span {
                start,
                end: end_for(start),
            },
            Err(_) => RangeSpec::Exhausted,
        };

        Ok(range)
    }

    /// Current cursor of a job, if it has been seen.
    pub async fn range_start(&self, job_key: &str) -> Option<u64> {
        self.jobs
            .read()
            .await
            .get(job_key)
            .map(|s| s.cursor.load(Ordering::Acquire))
    }

    /// All known jobs, sorted by job key.
    pub async fn allocations(&self) -> Vec<AllocationView> {
        let jobs = self.jobs.read().await;
        let mut views: Vec<AllocationView> = jobs
            .iter()
            .map(|(job_key, state)| AllocationView {
                job_key: job_key.clone(),
                range_start: state.cursor.load(Ordering::Acquire),
                first_request_at: state.first_request_at,
            })
            .collect();
        views.sort_by(|a, b| a.job_key.cmp(&b.job_key));
        views
    }

    async fn state_for(&self, job_key: &str) -> Arc<AllocationState> {
        if let Some(state) = self.jobs.read().await.get(job_key) {
            return state.clone();
        }

        let mut jobs = self.jobs.write().await;
        jobs.entry(job_key.to_string())
            .or_insert_with(|| {
                tracing::debug!(job_key, "Tracking allocations for new job");
                Arc::new(AllocationState::new())
            })
            .clone()
    }
}
