//! Refresh history: the most recent refresh attempts of every derived table.

use crate::types::{CycleId, TableId, Version};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Result of one refresh attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshStatus {
    /// Recompute finished and was committed (possibly as a no-op)
    Succeeded,
    /// Recompute failed; downstream stages were skipped
    Failed {
        /// Failure reason
        reason: String,
    },
    /// Not attempted because an upstream failed in the same cycle
    Skipped {
        /// Name of the failed upstream
        upstream: String,
    },
}

impl RefreshStatus {
    /// Whether the attempt succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One row of refresh history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRecord {
    /// Table refreshed
    pub table: TableId,
    /// Table name
    pub table_name: String,
    /// Cycle the attempt belonged to
    pub cycle: CycleId,
    /// Trigger label of the cycle
    pub trigger: String,
    /// Start time (engine clock)
    pub started_at: DateTime<Utc>,
    /// End time (engine clock)
    pub ended_at: DateTime<Utc>,
    /// Measured wall duration in milliseconds
    pub duration_ms: u64,
    /// Outcome
    pub status: RefreshStatus,
    /// Rows in the committed output
    pub rows: usize,
    /// Version current after the attempt
    pub version: Version,
    /// Whether a new version was published
    pub data_changed: bool,
}

/// Bounded per-table history
#[derive(Debug)]
pub struct RefreshHistory {
    capacity: usize,
    records: Mutex<HashMap<TableId, VecDeque<RefreshRecord>>>,
}

impl RefreshHistory {
    /// History keeping `capacity` records per table
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Append a record, evicting the oldest beyond capacity
    pub fn record(&self, record: RefreshRecord) {
        let mut guard = self.records.lock();
        let entries = guard.entry(record.table).or_default();
        entries.push_back(record);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Records for one table, most recent first
    #[must_use]
    pub fn for_table(&self, table: TableId) -> Vec<RefreshRecord> {
        self.records
            .lock()
            .get(&table)
            .map(|entries| entries.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest record for one table
    #[must_use]
    pub fn latest(&self, table: TableId) -> Option<RefreshRecord> {
        self.records
            .lock()
            .get(&table)
            .and_then(|entries| entries.back().cloned())
    }

    /// All records, most recent first
    #[must_use]
    pub fn all(&self) -> Vec<RefreshRecord> {
        let guard = self.records.lock();
        let mut out: Vec<RefreshRecord> = guard.values().flatten().cloned().collect();
        out.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then(b.cycle.cmp(&a.cycle))
                .then(a.table_name.cmp(&b.table_name))
        });
        out
    }

    /// Failed attempts across all tables, most recent first
    #[must_use]
    pub fn failures(&self) -> Vec<RefreshRecord> {
        self.all()
            .into_iter()
            .filter(|r| matches!(r.status, RefreshStatus::Failed { .. }))
            .collect()
    }
}
