use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    Payload(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Call {call} failed: {message}")]
    CallFailed { call: String, message: String },

    #[error(
        "Timeout of {} seconds exceeded waiting for function activations to finish",
        .0.as_secs()
    )]
    Timeout(Duration),

    #[error("Cancelled - Total activations not done: {not_done}")]
    Cancelled { not_done: usize },

    #[error("Shutdown requested")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchError {
    /// Whether a range request that failed this way may simply be sent again.
    pub fn is_transient(&self) -> bool {
        match self {
            BatchError::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.is_request()
                    || e.is_body()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            BatchError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
