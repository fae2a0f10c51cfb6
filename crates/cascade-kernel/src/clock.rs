//! Injected time source.
//!
//! Stages that depend on "now" read it through a `Clock` so a refresh is
//! deterministic for a given clock value.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Time capability handed to the engine and to every stage
pub trait Clock: Send + Sync + 'static {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;

    /// Current UTC calendar date
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct FixedClock {
    inner: Arc<RwLock<DateTime<Utc>>>,
}

impl FixedClock {
    /// Clock frozen at `at`
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(at)),
        }
    }

    /// Jump to `at`
    pub fn set(&self, at: DateTime<Utc>) {
        *self.inner.write() = at;
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.write();
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.read()
    }
}
