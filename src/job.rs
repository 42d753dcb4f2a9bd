use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BatchError, Result};

/// Byte span `[start, end]` of one call's input inside the submitted data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange(pub u64, pub u64);

/// A batch job as shipped to workers.
///
/// Fields the dispatch layer does not interpret (function location, runtime
/// settings, ...) are kept in `extra` and passed through to the handler untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub executor_id: String,
    pub job_id: String,
    #[serde(default)]
    pub job_key: String,
    pub total_calls: usize,
    pub call_ids: Vec<String>,
    #[serde(default)]
    pub data_byte_ranges: Vec<ByteRange>,
    #[serde(default = "default_one")]
    pub chunksize: usize,
    #[serde(default = "default_one")]
    pub worker_processes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_one() -> usize {
    1
}

impl JobPayload {
    /// Create a payload with `total_calls` zero-padded call ids and no input data.
    pub fn new(
        executor_id: impl Into<String>,
        job_id: impl Into<String>,
        total_calls: usize,
    ) -> Self {
        let executor_id = executor_id.into();
        let job_id = job_id.into();
        Self {
            job_key: format!("{}-{}", executor_id, job_id),
            executor_id,
            job_id,
            total_calls,
            call_ids: (0..total_calls).map(|i| format!("{:05}", i)).collect(),
            data_byte_ranges: Vec::new(),
            chunksize: 1,
            worker_processes: 1,
            activation_id: None,
            log_level: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = chunksize;
        self
    }

    pub fn with_worker_processes(mut self, worker_processes: usize) -> Self {
        self.worker_processes = worker_processes;
        self
    }

    pub fn with_data_byte_ranges(mut self, ranges: Vec<ByteRange>) -> Self {
        self.data_byte_ranges = ranges;
        self
    }

    pub fn with_activation_id(mut self, activation_id: String) -> Self {
        self.activation_id = Some(activation_id);
        self
    }

    /// The job key, derived from executor and job id when not set explicitly.
    pub fn job_key(&self) -> String {
        if self.job_key.is_empty() {
            format!("{}-{}", self.executor_id, self.job_id)
        } else {
            self.job_key.clone()
        }
    }

    /// Calls requested per allocation: enough to keep every local worker process busy.
    pub fn effective_chunksize(&self) -> usize {
        self.worker_processes.max(self.chunksize).max(1)
    }

    /// Restrict the payload to the calls in `[start, end)`.
    ///
    /// Byte ranges are looked up by the numeric value of each call id.
    pub fn window(&self, start: usize, end: usize) -> Result<JobPayload> {
        if start > end || end > self.call_ids.len() {
            return Err(BatchError::Payload(format!(
                "range {}-{} out of bounds for {} call ids",
                start,
                end,
                self.call_ids.len()
            )));
        }

        let call_ids = self.call_ids[start..end].to_vec();
        let data_byte_ranges = if self.data_byte_ranges.is_empty() {
            Vec::new()
        } else {
            call_ids
                .iter()
                .map(|call_id| self.byte_range_for(call_id))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(JobPayload {
            call_ids,
            data_byte_ranges,
            ..self.clone()
        })
    }

    /// Restrict the payload to the single call at position `index`.
    pub fn for_call(&self, index: usize) -> Result<JobPayload> {
        let call_id = self.call_ids.get(index).cloned().ok_or_else(|| {
            BatchError::Payload(format!(
                "call index {} out of bounds for {} call ids",
                index,
                self.call_ids.len()
            ))
        })?;

        let data_byte_ranges = if self.data_byte_ranges.is_empty() {
            Vec::new()
        } else {
            let range = self.data_byte_ranges.get(index).copied().ok_or_else(|| {
                BatchError::Payload(format!("no data byte range for call index {}", index))
            })?;
            vec![range]
        };

        Ok(JobPayload {
            call_ids: vec![call_id],
            data_byte_ranges,
            ..self.clone()
        })
    }

    fn byte_range_for(&self, call_id: &str) -> Result<ByteRange> {
        let index: usize = call_id
            .parse()
            .map_err(|_| BatchError::Payload(format!("call id {:?} is not numeric", call_id)))?;
        self.data_byte_ranges
            .get(index)
            .copied()
            .ok_or_else(|| BatchError::Payload(format!("no data byte range for call {}", call_id)))
    }
}

/// Random 12-hex-char id distinguishing one execution round from another.
pub fn new_activation_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

/// Decode a base64-encoded JSON payload, as passed on the command line.
pub fn decode_payload<T: DeserializeOwned>(encoded: &str) -> Result<T> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| BatchError::Payload(format!("invalid base64: {}", e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Encode a payload the way `decode_payload` expects it.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<String> {
    Ok(STANDARD.encode(serde_json::to_vec(payload)?))
}
