//! Invocation side of the dispatch layer.
//!
//! Both dispatch models end by handing a (possibly windowed) [`JobPayload`]
//! to a [`FunctionHandler`]:
//!
//! - the pull worker hands over one allocated range at a time and waits for it;
//! - the fanout scheduler hands over a single call per slot and does not wait.
//!
//! [`CommandHandler`] is the process-backed handler: every `handle` call
//! spawns one `sh -c` process that receives the payload on stdin.
//!
//! [`JobPayload`]: crate::job::JobPayload

pub mod executor;

pub use executor::{CommandHandler, FunctionHandler, InvocationReport, InvocationStatus};
