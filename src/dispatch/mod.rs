//! Work distribution.
//!
//! Two models share the same payload and invocation path:
//!
//! - **Pull**: a master serves disjoint call ranges over HTTP
//!   ([`server`], [`allocator`]); workers loop on [`pull::PullWorker`] until
//!   the master answers with the exhausted sentinel.
//! - **Fanout**: every pod receives every job message ([`broker`]) and runs
//!   the share [`partition`] assigns to its CPU range, bounded by [`slots`].

pub mod allocator;
pub mod broker;
pub mod fanout;
pub mod partition;
pub mod pull;
pub mod range;
pub mod server;
pub mod slots;

pub use allocator::{AllocationView, RangeAllocator};
pub use broker::{FanoutBroker, MemoryBroker, RedisStreamBroker, Subscription};
pub use fanout::{DispatchSummary, FanoutScheduler, ListenerStats};
pub use partition::{CpuRange, PodShare};
pub use pull::{HttpRangeSource, PullSummary, PullWorker, RangeSource};
pub use range::{RangeSpec, EXHAUSTED_SENTINEL};
pub use server::MasterState;
pub use slots::{SlotCounter, SlotGuard};
