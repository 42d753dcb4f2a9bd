//! Client-side completion tracking.
//!
//! A submitted call is represented by a [`CallFuture`]. [`FutureWaitEngine`]
//! groups futures by job, lets a [`JobMonitor`] discover which calls have a
//! status in the [`CallStore`], fetches those statuses or results with bounded
//! parallelism, and repeats until the requested [`ReturnWhen`] condition holds.

pub mod engine;
pub mod future;
pub mod monitor;
pub mod progress;
pub mod store;

pub use engine::{FutureWaitEngine, ReturnWhen, WaitOptions, WaitOutcome};
pub use future::{CallFuture, CallKey, CallOutput, CallStatus};
pub use monitor::{JobMonitor, MonitoredJob, StorageMonitor};
pub use progress::{ProgressSink, TracingProgress};
pub use store::{CallStore, MemoryStore, MemoryStoreProvider, StoreProvider};
