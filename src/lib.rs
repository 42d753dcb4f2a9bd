pub mod config;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod job;
pub mod shutdown;
pub mod wait;
pub mod worker;

pub use error::{BatchError, Result};
