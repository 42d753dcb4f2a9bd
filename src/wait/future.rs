use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BatchError, Result};

/// Storage coordinates of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallKey {
    pub executor_id: String,
    pub job_id: String,
    pub call_id: String,
}

impl CallKey {
    pub fn new(
        executor_id: impl Into<String>,
        job_id: impl Into<String>,
        call_id: impl Into<String>,
    ) -> Self {
        Self {
            executor_id: executor_id.into(),
            job_id: job_id.into(),
            call_id: call_id.into(),
        }
    }

    pub fn job_key(&self) -> String {
        format!("{}-{}", self.executor_id, self.job_id)
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.executor_id, self.job_id, self.call_id)
    }
}

/// Status record a call leaves behind when it finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatus {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_id: Option<String>,
}

impl CallStatus {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            activation_id: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            activation_id: None,
        }
    }
}

/// What a successful call produced: a value, or further calls it dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CallOutput {
    Value(Value),
    Futures(Vec<CallKey>),
}

/// Client-side handle on one call's asynchronous outcome.
///
/// `ready` means the status is known, `done` means the outcome is final: the
/// result was retrieved, the call failed, or it produces no output. Neither
/// flag is ever cleared once set.
#[derive(Debug, Clone)]
pub struct CallFuture {
    key: CallKey,
    storage_backend: String,
    produce_output: bool,
    ready: bool,
    done: bool,
    status: Option<CallStatus>,
    result: Option<std::result::Result<Value, String>>,
    children: Vec<CallKey>,
}

impl CallFuture {
    pub fn new(key: CallKey, storage_backend: impl Into<String>) -> Self {
        Self {
            key,
            storage_backend: storage_backend.into(),
            produce_output: true,
            ready: false,
            done: false,
            status: None,
            result: None,
            children: Vec::new(),
        }
    }

    /// Mark the call as one that stores no result.
    pub fn without_output(mut self) -> Self {
        self.produce_output = false;
        self
    }

    pub fn key(&self) -> &CallKey {
        &self.key
    }

    pub fn job_key(&self) -> String {
        self.key.job_key()
    }

    pub fn storage_backend(&self) -> &str {
        &self.storage_backend
    }

    pub fn produce_output(&self) -> bool {
        self.produce_output
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn status(&self) -> Option<&CallStatus> {
        self.status.as_ref()
    }

    /// Calls dispatched by this call; empty until its result has been fetched.
    pub fn children(&self) -> &[CallKey] {
        &self.children
    }

    /// Whether this future counts as complete for a wait.
    pub fn is_complete(&self, download_results: bool) -> bool {
        if download_results {
            self.done
        } else {
            self.ready || self.done
        }
    }

    /// Captured outcome. A captured failure is returned as an error when
    /// `throw_except` is set and as `Value::Null` otherwise.
    pub fn result(&self, throw_except: bool) -> Result<Value> {
        match &self.result {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(message)) if throw_except => Err(self.failure(message)),
            Some(Err(_)) | None => Ok(Value::Null),
        }
    }

    /// Record a retrieved status.
    pub fn apply_status(&mut self, status: CallStatus, throw_except: bool) -> Result<()> {
        let failure = (!status.success).then(|| {
            status
                .error
                .clone()
                .unwrap_or_else(|| "call raised an exception".to_string())
        });
        self.status = Some(status);
        self.ready = true;

        match failure {
            Some(message) => {
                self.done = true;
                self.result = Some(Err(message.clone()));
                if throw_except {
                    return Err(self.failure(&message));
                }
            }
            None if !self.produce_output => self.done = true,
            None => {}
        }
        Ok(())
    }

    /// Record a retrieved output. Children become visible from here on.
    pub fn apply_output(&mut self, output: CallOutput) {
        match output {
            CallOutput::Value(value) => self.result = Some(Ok(value)),
            CallOutput::Futures(children) => {
                self.result = Some(Ok(Value::Null));
                self.children = children;
            }
        }
        self.ready = true;
        self.done = true;
    }

    fn failure(&self, message: &str) -> BatchError {
        BatchError::CallFailed {
            call: self.key.to_string(),
            message: message.to_string(),
        }
    }
}
