//! Append-only ingest buffer for raw events.
//!
//! Producers hand in loosely typed [`RawEventRecord`]s. Each record is
//! validated on its own; bad records are rejected with a [`RejectReason`]
//! and never abort the rest of the batch. Accepted events get a global
//! sequence number and are appended to the [`EventLog`], which is what the
//! `raw_events` source table holds.

use crate::error::RejectReason;
use crate::model::{EventType, MemberId, RawEvent, ResourceId};
use cascade_kernel::{CycleReport, Fingerprint, Materialized};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

/// Largest engagement a single event may report, about 136 years
pub const MAX_ENGAGEMENT_SECONDS: u64 = u32::MAX as u64;

/// An event as submitted by a producer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEventRecord {
    pub member_id: Option<MemberId>,
    pub session_id: Option<String>,
    pub resource_id: Option<ResourceId>,
    pub event_type: Option<String>,
    /// RFC 3339 timestamp
    pub timestamp: Option<String>,
    pub engagement_seconds: Option<i64>,
    pub device_type: Option<String>,
}

impl RawEventRecord {
    /// Record with every required field set
    #[must_use]
    pub fn new(
        member_id: MemberId,
        session_id: impl Into<String>,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            member_id: Some(member_id),
            session_id: Some(session_id.into()),
            event_type: Some(event_type.to_string()),
            timestamp: Some(timestamp.to_rfc3339()),
            ..Self::default()
        }
    }

    /// With a resource id
    #[must_use]
    pub fn with_resource(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    /// With engagement seconds
    #[must_use]
    pub fn with_engagement(mut self, seconds: i64) -> Self {
        self.engagement_seconds = Some(seconds);
        self
    }

    /// With a device type
    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device_type = Some(device.into());
        self
    }

    /// Validate into an event carrying sequence number `seq`
    pub fn validate(&self, seq: u64) -> Result<RawEvent, RejectReason> {
        let member_id = self.member_id.ok_or_else(|| RejectReason::missing("member_id"))?;
        let session_id = non_blank(self.session_id.as_deref())
            .ok_or_else(|| RejectReason::missing("session_id"))?;
        let event_type = non_blank(self.event_type.as_deref())
            .ok_or_else(|| RejectReason::missing("event_type"))?
            .parse::<EventType>()
            .map_err(|value| RejectReason::UnknownEventType { value })?;
        let raw_ts = non_blank(self.timestamp.as_deref())
            .ok_or_else(|| RejectReason::missing("timestamp"))?;
        let timestamp = DateTime::parse_from_rfc3339(raw_ts)
            .map_err(|_| RejectReason::InvalidTimestamp {
                value: raw_ts.to_string(),
            })?
            .with_timezone(&Utc);
        let engagement_seconds = self.engagement_seconds.map(engagement).transpose()?;

        Ok(RawEvent {
            seq,
            member_id,
            session_id: session_id.to_string(),
            resource_id: self.resource_id,
            event_type,
            timestamp,
            engagement_seconds,
            device_type: non_blank(self.device_type.as_deref()).map(str::to_string),
        })
    }
}

fn engagement(value: i64) -> Result<u64, RejectReason> {
    let seconds = u64::try_from(value).map_err(|_| RejectReason::NegativeEngagement { value })?;
    if seconds > MAX_ENGAGEMENT_SECONDS {
        return Err(RejectReason::EngagementOutOfRange { value });
    }
    Ok(seconds)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Immutable snapshot of the append-only event log
///
/// Batches are shared between snapshots, so taking one is cheap.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    batches: Vec<Arc<[RawEvent]>>,
    len: usize,
}

impl EventLog {
    /// Number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// No events yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Every event in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &RawEvent> {
        self.batches.iter().flat_map(|batch| batch.iter())
    }

    /// Events from position `offset` onward
    ///
    /// Whole batches before `offset` are skipped by length without being
    /// walked.
    pub fn iter_from(&self, offset: usize) -> impl Iterator<Item = &RawEvent> {
        let mut skip = offset;
        let first = self
            .batches
            .iter()
            .position(|batch| {
                if skip < batch.len() {
                    true
                } else {
                    skip -= batch.len();
                    false
                }
            })
            .unwrap_or(self.batches.len());
        self.batches[first..]
            .iter()
            .enumerate()
            .flat_map(move |(i, batch)| batch[if i == 0 { skip } else { 0 }..].iter())
    }

    /// Sequence number of the newest event
    #[must_use]
    pub fn last_seq(&self) -> Option<u64> {
        self.batches
            .iter()
            .rev()
            .find_map(|batch| batch.last())
            .map(|event| event.seq)
    }

    pub(crate) fn append(&self, batch: Vec<RawEvent>) -> Self {
        let mut batches = self.batches.clone();
        let len = self.len + batch.len();
        batches.push(Arc::from(batch));
        Self { batches, len }
    }

    /// Wrap for the `raw_events` source
    ///
    /// The log is append-only with unique sequence numbers, so its length and
    /// last sequence number identify its contents.
    #[must_use]
    pub fn materialize(&self) -> Materialized {
        let identity = format!("{}:{:?}", self.len, self.last_seq());
        let fingerprint = Fingerprint::of_bytes(identity.as_bytes());
        Materialized::with_fingerprint(self.clone(), self.len, fingerprint)
    }
}

/// A rejected record and its position in the submitted batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub index: usize,
    pub reason: RejectReason,
}

/// Outcome of one ingest call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: Vec<RejectedRecord>,
    /// Buffer size after the batch
    pub total: usize,
    /// Propagation cycle run for the batch, when auto-refresh is on
    pub refresh: Option<CycleReport>,
}

/// Cumulative ingest counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub accepted: u64,
    pub rejected: u64,
    /// Rejects by [`RejectReason::code`]
    pub rejected_by_reason: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct BufferState {
    log: EventLog,
    next_seq: u64,
    stats: IngestStats,
}

/// Validating, append-only event buffer
#[derive(Debug, Default)]
pub struct IngestBuffer {
    state: Mutex<BufferState>,
}

/// Result of appending one batch
#[derive(Debug)]
pub struct Appended {
    pub accepted: usize,
    pub rejected: Vec<RejectedRecord>,
    /// Snapshot including the batch
    pub log: EventLog,
}

impl IngestBuffer {
    /// Empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and append a batch
    ///
    /// `publish` runs while the buffer is still locked, so snapshots reach the
    /// source table in append order.
    pub(crate) fn append<E>(
        &self,
        records: &[RawEventRecord],
        publish: impl FnOnce(&EventLog) -> Result<(), E>,
    ) -> Result<Appended, E> {
        let mut state = self.state.lock();
        let mut accepted = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        let mut seq = state.next_seq;

        for (index, record) in records.iter().enumerate() {
            match record.validate(seq) {
                Ok(event) => {
                    accepted.push(event);
                    seq += 1;
                }
                Err(reason) => {
                    tracing::debug!(index, reason = %reason, "event rejected");
                    rejected.push(RejectedRecord { index, reason });
                }
            }
        }

        let log = if accepted.is_empty() {
            state.log.clone()
        } else {
            let log = state.log.append(std::mem::take(&mut accepted));
            publish(&log)?;
            log
        };

        let count = log.len() - state.log.len();
        state.log = log.clone();
        state.next_seq = seq;
        state.stats.accepted += count as u64;
        state.stats.rejected += rejected.len() as u64;
        for reject in &rejected {
            *state
                .stats
                .rejected_by_reason
                .entry(reject.reason.code().to_string())
                .or_insert(0) += 1;
        }

        Ok(Appended {
            accepted: count,
            rejected,
            log,
        })
    }

    /// Validate and append a batch without publishing it
    pub fn extend(&self, records: &[RawEventRecord]) -> Appended {
        match self.append(records, |_| Ok::<(), Infallible>(())) {
            Ok(appended) => appended,
            Err(never) => match never {},
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> EventLog {
        self.state.lock().log.clone()
    }

    /// Number of buffered events
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// No events buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cumulative counters
    #[must_use]
    pub fn stats(&self) -> IngestStats {
        self.state.lock().stats.clone()
    }
}
