//! Injectable time source
//!
//! Every TTL, grace period and retention window in the crate is evaluated
//! against a [`Clock`], so sweeps can be driven deterministically in tests by
//! advancing a [`ManualClock`] instead of sleeping.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Source of the current time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Move forward by `by`
    pub fn advance(&self, by: std::time::Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        *self.now.write() += by;
    }

    /// Jump to an absolute time
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Convert a std duration into a chrono duration
pub fn to_chrono(duration: std::time::Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::Config(format!("Duration out of range {:?}: {}", duration, e)))
}
