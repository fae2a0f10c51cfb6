//! Versioned storage of committed table contents.
//!
//! Every commit is atomic: readers either see the previous committed version
//! or the new one, never a partially written table. A bounded window of older
//! versions is retained for point-in-time reads.

use crate::error::{EngineError, StageError};
use crate::types::{TableId, Version};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Type-erased table payload
pub type TableData = Arc<dyn Any + Send + Sync>;

/// SHA-256 digest of a table's encoded rows
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Digest of raw bytes
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Digest of the JSON encoding of `value`
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self, StageError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StageError::Encoding(e.to_string()))?;
        Ok(Self::of_bytes(&bytes))
    }

    /// Hex rendering
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Contents produced by a stage or written to a source
#[derive(Clone)]
pub struct Materialized {
    data: TableData,
    row_count: usize,
    fingerprint: Fingerprint,
}

impl Materialized {
    /// Wrap a row vector, fingerprinting its JSON encoding
    pub fn from_rows<T>(rows: Vec<T>) -> Result<Self, StageError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let fingerprint = Fingerprint::of(&rows)?;
        Ok(Self {
            row_count: rows.len(),
            data: Arc::new(rows),
            fingerprint,
        })
    }

    /// Wrap arbitrary data with a caller-computed fingerprint
    ///
    /// Used for large append-only payloads where re-encoding every row on
    /// each write would be wasteful.
    pub fn with_fingerprint<T>(data: T, row_count: usize, fingerprint: Fingerprint) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self {
            data: Arc::new(data),
            row_count,
            fingerprint,
        }
    }

    /// Erased payload
    #[must_use]
    pub fn data(&self) -> &TableData {
        &self.data
    }

    /// Typed view of the payload
    #[must_use]
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.data).downcast::<T>().ok()
    }

    /// Number of rows
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Content digest
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl fmt::Debug for Materialized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Materialized")
            .field("row_count", &self.row_count)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// A committed, immutable table version
#[derive(Debug, Clone)]
pub struct CommittedTable {
    /// Owning table
    pub table: TableId,
    /// Commit version
    pub version: Version,
    /// Commit time (engine clock)
    pub committed_at: DateTime<Utc>,
    /// Contents
    pub contents: Materialized,
}

impl CommittedTable {
    /// Typed rows, if the payload is a `Vec<T>`
    #[must_use]
    pub fn rows<T: Send + Sync + 'static>(&self) -> Option<Arc<Vec<T>>> {
        self.contents.downcast::<Vec<T>>()
    }
}

/// Outcome of a commit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// New version published
    Committed(Version),
    /// Contents identical to the current version; nothing published
    Unchanged(Version),
}

impl CommitOutcome {
    /// Version current after the commit
    #[must_use]
    pub fn version(&self) -> Version {
        match self {
            Self::Committed(v) | Self::Unchanged(v) => *v,
        }
    }

    /// Whether a new version was published
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

#[derive(Debug, Default)]
struct TableVersions {
    latest: Option<Arc<CommittedTable>>,
    retained: VecDeque<Arc<CommittedTable>>,
}

/// Store of committed versions for every table
#[derive(Debug)]
pub struct TableStore {
    tables: RwLock<HashMap<TableId, TableVersions>>,
    retain: usize,
}

impl TableStore {
    /// Store keeping `retain` superseded versions per table
    #[must_use]
    pub fn new(retain: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            retain,
        }
    }

    /// Publish `contents` as the next version of `table`
    ///
    /// Identical contents (same fingerprint) are not republished.
    pub fn commit(
        &self,
        table: TableId,
        contents: Materialized,
        at: DateTime<Utc>,
    ) -> CommitOutcome {
        let mut tables = self.tables.write();
        let entry = tables.entry(table).or_default();

        let current = entry.latest.as_ref().map(|c| (c.version, c.contents.fingerprint()));
        if let Some((version, fingerprint)) = current {
            if fingerprint == contents.fingerprint() {
                return CommitOutcome::Unchanged(version);
            }
        }

        let version = current.map_or(Version::NONE, |(v, _)| v).next();
        let committed = Arc::new(CommittedTable {
            table,
            version,
            committed_at: at,
            contents,
        });
        if let Some(previous) = entry.latest.replace(committed) {
            if self.retain > 0 {
                entry.retained.push_back(previous);
                while entry.retained.len() > self.retain {
                    entry.retained.pop_front();
                }
            }
        }
        CommitOutcome::Committed(version)
    }

    /// Latest committed version
    #[must_use]
    pub fn latest(&self, table: TableId) -> Option<Arc<CommittedTable>> {
        self.tables.read().get(&table).and_then(|t| t.latest.clone())
    }

    /// Latest committed version number (`Version::NONE` if never committed)
    #[must_use]
    pub fn current_version(&self, table: TableId) -> Version {
        self.latest(table).map_or(Version::NONE, |t| t.version)
    }

    /// A specific version, if still retained
    #[must_use]
    pub fn at_version(&self, table: TableId, version: Version) -> Option<Arc<CommittedTable>> {
        let tables = self.tables.read();
        let entry = tables.get(&table)?;
        entry
            .latest
            .iter()
            .chain(entry.retained.iter())
            .find(|c| c.version == version)
            .cloned()
    }

    /// Versions currently readable for `table`, oldest first
    #[must_use]
    pub fn versions(&self, table: TableId) -> Vec<Version> {
        let tables = self.tables.read();
        tables.get(&table).map_or_else(Vec::new, |entry| {
            entry
                .retained
                .iter()
                .chain(entry.latest.iter())
                .map(|c| c.version)
                .collect()
        })
    }

    /// Typed rows of the latest version
    pub fn read_rows<T: Send + Sync + 'static>(
        &self,
        table: TableId,
        name: &str,
    ) -> Result<Arc<Vec<T>>, EngineError> {
        let committed = self
            .latest(table)
            .ok_or_else(|| EngineError::NotMaterialized(name.to_string()))?;
        committed.rows::<T>().ok_or(EngineError::TypeMismatch {
            table: name.to_string(),
            expected: std::any::type_name::<Vec<T>>(),
        })
    }
}
