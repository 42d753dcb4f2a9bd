//! Static partitioning of a job's calls across pods.
//!
//! Every CPU in the cluster has a global index in `[0, num_cpus_cluster)` and
//! each pod owns a contiguous, inclusive slice of those indices. Call `i` runs
//! on CPU `i % num_cpus_cluster`, so a pod executes `base` calls per CPU plus
//! one more for each of its CPUs below the remainder `total_calls % num_cpus_cluster`.

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

/// Inclusive `[start, end]` slice of the cluster-wide CPU numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuRange {
    pub start: usize,
    pub end: usize,
}

impl CpuRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn cpus(&self) -> usize {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.start <= cpu && cpu <= self.end
    }
}

/// A pod's fair share of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodShare {
    /// Calls this pod must execute
    pub pod_executions: usize,
    /// Calls every CPU in the cluster executes before the remainder is handed out
    pub base_executions: usize,
}

/// Compute how many calls a pod executes.
///
/// The pod whose range contains the remainder boundary gets the part of the
/// remainder below the boundary; pods entirely below it get one extra call per
/// CPU; pods above it get none.
pub fn plan(
    num_cpus_cluster: usize,
    pod_cpus: usize,
    range: CpuRange,
    total_calls: usize,
) -> Result<PodShare> {
    if num_cpus_cluster == 0 {
        return Err(BatchError::InvalidArgument(
            "num_cpus_cluster must be > 0".to_string(),
        ));
    }

    let base_executions = total_calls / num_cpus_cluster;
    let remainder = total_calls % num_cpus_cluster;

    let mut pod_executions = pod_cpus * base_executions;
    if range.start <= remainder && remainder <= range.end {
        pod_executions += remainder - range.start;
    } else if remainder > range.start {
        pod_executions += pod_cpus;
    }

    Ok(PodShare {
        pod_executions,
        base_executions,
    })
}

/// Calls addressable by the pod's CPU range in the first wave, clipped to the
/// job size. `None` when the pod's range lies entirely past the last call.
pub fn requested_cpus(range: CpuRange, total_calls: usize) -> Option<usize> {
    if total_calls <= range.start {
        return None;
    }
    if range.end > total_calls - 1 {
        Some(total_calls - range.start)
    } else {
        Some(range.cpus())
    }
}

/// Ordered call indices a pod launches for a job.
///
/// The first wave covers the pod's own CPU indices; each following round `r`
/// covers `num_cpus_cluster * r + range.start + slot` for the pod's slots,
/// until the pod's share is used up.
pub fn launch_schedule(
    num_cpus_cluster: usize,
    range: CpuRange,
    total_calls: usize,
) -> Result<Vec<usize>> {
    let Some(requested) = requested_cpus(range, total_calls) else {
        return Ok(Vec::new());
    };

    let pod_cpus = range.cpus();
    let share = plan(num_cpus_cluster, pod_cpus, range, total_calls)?;

    let mut remaining = share.pod_executions;
    let first_wave = requested.min(pod_cpus).min(remaining);
    let mut indices: Vec<usize> = (0..first_wave).map(|slot| range.start + slot).collect();
    remaining -= first_wave;

    for round in 1..=share.base_executions + 1 {
        for slot in 0..pod_cpus {
            if remaining == 0 {
                return Ok(indices);
            }
            let index = num_cpus_cluster * round + range.start + slot;
            if index >= total_calls {
                break;
            }
            indices.push(index);
            remaining -= 1;
        }
    }

    if remaining > 0 {
        tracing::warn!(
            remaining,
            range_start = range.start,
            range_end = range.end,
            num_cpus_cluster,
            "Pod share exceeds its addressable calls"
        );
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_inside_remainder_region() {
        // 12 calls on 5 CPUs: base 2, remainder 2, pod owns CPUs 0-1.
        let share = plan(5, 2, CpuRange::new(0, 1), 12).unwrap();
        assert_eq!(share.base_executions, 2);
        assert_eq!(share.pod_executions, 6);
    }

    #[test]
    fn pod_straddling_remainder_boundary() {
        // remainder 3 falls inside [2, 4]: CPU 2 gets the only extra call.
        let share = plan(5, 3, CpuRange::new(2, 4), 13).unwrap();
        assert_eq!(share.base_executions, 2);
        assert_eq!(share.pod_executions, 3 * 2 + 1);
    }

    #[test]
    fn pod_past_remainder_region() {
        let share = plan(5, 2, CpuRange::new(3, 4), 12).unwrap();
        assert_eq!(share.pod_executions, 4);
    }

    #[test]
    fn remainder_at_range_start_adds_nothing() {
        let share = plan(4, 2, CpuRange::new(2, 3), 6).unwrap();
        assert_eq!(share.base_executions, 1);
        assert_eq!(share.pod_executions, 2);
    }

    #[test]
    fn zero_cluster_cpus_is_rejected() {
        assert!(plan(0, 1, CpuRange::new(0, 0), 10).is_err());
    }

    #[test]
    fn requested_cpus_clips_to_total() {
        assert_eq!(requested_cpus(CpuRange::new(0, 3), 10), Some(4));
        assert_eq!(requested_cpus(CpuRange::new(2, 5), 4), Some(2));
        assert_eq!(requested_cpus(CpuRange::new(4, 5), 4), None);
    }

    #[test]
    fn schedule_first_wave_then_rounds() {
        let schedule = launch_schedule(5, CpuRange::new(0, 1), 12).unwrap();
        assert_eq!(schedule, vec![0, 1, 5, 6, 10, 11]);

        let schedule = launch_schedule(5, CpuRange::new(2, 4), 12).unwrap();
        assert_eq!(schedule, vec![2, 3, 4, 7, 8, 9]);
    }

    #[test]
    fn schedule_for_small_job() {
        // Fewer calls than CPUs: only the pod's own indices below the total run.
        assert_eq!(launch_schedule(8, CpuRange::new(0, 3), 2).unwrap(), vec![0, 1]);
        assert!(launch_schedule(8, CpuRange::new(4, 7), 2).unwrap().is_empty());
    }
}
