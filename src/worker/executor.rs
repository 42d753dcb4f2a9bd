use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::HandlerConfig;
use crate::job::JobPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationStatus::Completed => write!(f, "completed"),
            InvocationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of handing a payload to the function handler.
///
/// Dispatch only logs this; call results reach clients through the call store.
#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub job_key: String,
    pub call_ids: Vec<String>,
    pub activation_id: Option<String>,
    pub status: InvocationStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl InvocationReport {
    pub fn completed(payload: &JobPayload) -> Self {
        Self {
            job_key: payload.job_key(),
            call_ids: payload.call_ids.clone(),
            activation_id: payload.activation_id.clone(),
            status: InvocationStatus::Completed,
            exit_code: Some(0),
            output: None,
            error: None,
        }
    }

    pub fn failed(payload: &JobPayload, error: String) -> Self {
        Self {
            status: InvocationStatus::Failed,
            exit_code: None,
            error: Some(error),
            ..Self::completed(payload)
        }
    }
}

/// Executes the calls contained in a payload. Runs synchronously from the
/// caller's point of view: `handle` returns once the calls have finished.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn handle(&self, payload: JobPayload) -> InvocationReport;
}

/// Runs each invocation as its own `sh -c` process.
///
/// The process receives the payload as JSON on stdin and the environment
/// variables `BATCH_JOB_KEY`, `BATCH_CALL_IDS` (comma separated) and
/// `BATCH_ACTIVATION_ID`.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    config: HandlerConfig,
}

impl CommandHandler {
    pub fn new(config: HandlerConfig) -> Self {
        Self { config }
    }

    async fn run(&self, payload: &JobPayload) -> std::io::Result<std::process::Output> {
        let body = serde_json::to_vec(payload)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.config.command)
            .envs(&self.config.env)
            .env("BATCH_JOB_KEY", payload.job_key())
            .env("BATCH_CALL_IDS", payload.call_ids.join(","))
            .env(
                "BATCH_ACTIVATION_ID",
                payload.activation_id.as_deref().unwrap_or_default(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full stdout pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&body).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        tracing::debug!(error = %e, "Failed to write payload to handler stdin");
                    }
                }
            })
        });

        let output = child.wait_with_output().await;
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        output
    }

    fn process_output(
        payload: &JobPayload,
        result: std::io::Result<std::process::Output>,
    ) -> InvocationReport {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let (status, error) = if output.status.success() {
                    (InvocationStatus::Completed, None)
                } else {
                    (
                        InvocationStatus::Failed,
                        Some(if stderr.is_empty() {
                            format!("Exit code: {:?}", exit_code)
                        } else {
                            stderr
                        }),
                    )
                };

                tracing::info!(
                    job_key = %payload.job_key(),
                    calls = payload.call_ids.len(),
                    status = %status,
                    exit_code = ?exit_code,
                    "Invocation finished"
                );

                InvocationReport {
                    status,
                    exit_code,
                    output: if stdout.is_empty() { None } else { Some(stdout) },
                    error,
                    ..InvocationReport::completed(payload)
                }
            }
            Err(e) => {
                tracing::error!(job_key = %payload.job_key(), error = %e, "Invocation could not start");
                InvocationReport::failed(payload, e.to_string())
            }
        }
    }
}

#[async_trait]
impl FunctionHandler for CommandHandler {
    async fn handle(&self, payload: JobPayload) -> InvocationReport {
        tracing::debug!(
            job_key = %payload.job_key(),
            call_ids = ?payload.call_ids,
            activation_id = ?payload.activation_id,
            "Executing calls"
        );
        let result = self.run(&payload).await;
        Self::process_output(&payload, result)
    }
}
