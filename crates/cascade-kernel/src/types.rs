//! Core identifiers and policy types shared by the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

static NEXT_TABLE_ID: AtomicU32 = AtomicU32::new(1);

/// Handle to a registered table (source or derived)
///
/// Ids are process-unique and cheap to copy so they can key the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(pub u32);

impl TableId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Monotonic per-table commit counter. Version 0 means "never committed".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// Version of a table that has never been committed
    pub const NONE: Version = Version(0);

    /// The version following this one
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifier of a single refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CycleId(pub u64);

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle-{}", self.0)
    }
}

/// When a derived table refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Refresh whenever an upstream commit makes it stale and a cycle reaches it
    Reactive,
    /// Refresh unconditionally each time the interval elapses
    Interval {
        /// Refresh period
        #[serde(with = "duration_secs")]
        every: Duration,
    },
}

impl RefreshPolicy {
    /// Fixed-interval policy
    #[must_use]
    pub fn every(every: Duration) -> Self {
        Self::Interval { every }
    }

    /// Whether this policy lets upstream commits pull the table into a cycle
    #[must_use]
    pub fn is_reactive(&self) -> bool {
        matches!(self, Self::Reactive)
    }
}

impl fmt::Display for RefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reactive => write!(f, "reactive"),
            Self::Interval { every } => write!(f, "every {}s", every.as_secs()),
        }
    }
}

/// Source tables are written externally, derived tables by an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Externally written leaf table
    Source,
    /// Table defined by a stage operator
    Derived,
}

/// What started a refresh cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Initial refresh of every derived table
    Bootstrap,
    /// One or more sources received new data
    SourcesChanged {
        /// Changed sources
        tables: Vec<TableId>,
    },
    /// Scheduler tick (interval and time-dependent stages)
    Tick,
    /// Explicit refresh request for specific tables
    Manual {
        /// Tables to refresh
        tables: Vec<TableId>,
    },
}

impl Trigger {
    /// Short label used in logs and history
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::SourcesChanged { .. } => "sources_changed",
            Self::Tick => "tick",
            Self::Manual { .. } => "manual",
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ids_are_unique() {
        let a = TableId::next();
        let b = TableId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn version_ordering() {
        assert!(Version::NONE < Version::NONE.next());
        assert_eq!(Version(4).next(), Version(5));
    }

    #[test]
    fn policy_roundtrips_through_json() {
        let policy = RefreshPolicy::every(Duration::from_secs(60));
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#"{"kind":"interval","every":60}"#);
        let back: RefreshPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
        assert!(!back.is_reactive());
    }
}
