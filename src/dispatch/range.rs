use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Wire text for "no more work".
pub const EXHAUSTED_SENTINEL: &str = "-1";

/// Answer to a range request: a half-open span of call indices, or the sentinel
/// telling the worker the job has been fully handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeSpec {
    Span { start: u64, end: u64 },
    Exhausted,
}

impl RangeSpec {
    pub fn len(&self) -> u64 {
        match self {
            RangeSpec::Span { start, end } => end.saturating_sub(*start),
            RangeSpec::Exhausted => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RangeSpec::Exhausted)
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeSpec::Span { start, end } => write!(f, "{}-{}", start, end),
            RangeSpec::Exhausted => write!(f, "{}", EXHAUSTED_SENTINEL),
        }
    }
}

impl FromStr for RangeSpec {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == EXHAUSTED_SENTINEL {
            return Ok(RangeSpec::Exhausted);
        }

        let invalid = || BatchError::InvalidArgument(format!("malformed range {:?}", s));
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.parse().map_err(|_| invalid())?;
        let end: u64 = end.parse().map_err(|_| invalid())?;
        if end < start {
            return Err(invalid());
        }
        Ok(RangeSpec::Span { start, end })
    }
}
