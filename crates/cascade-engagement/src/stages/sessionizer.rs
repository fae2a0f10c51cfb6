//! Sessionizer: incremental group-by of raw events into sessions.
//!
//! The operator keeps one accumulator per `(session_id, member_id)` and the
//! log offset it has folded up to. A refresh folds only the events appended
//! since the previous refresh, then emits every group. The emitted table is
//! identical to grouping the whole log from scratch.

use super::{overflow, RAW_EVENTS};
use crate::ingest::EventLog;
use crate::model::{MemberId, RawEvent, ResourceId, Session};
use cascade_kernel::{Materialized, RefreshContext, StageError, StageOperator};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

type SessionKey = (String, MemberId);

#[derive(Debug, Clone)]
struct SessionAccumulator {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    event_count: u64,
    engagement_seconds: u64,
    resources: BTreeSet<ResourceId>,
    /// `(timestamp, seq, device)` of the latest event with a device
    device: Option<(DateTime<Utc>, u64, String)>,
}

impl SessionAccumulator {
    fn open(event: &RawEvent) -> Self {
        Self {
            start: event.timestamp,
            end: event.timestamp,
            event_count: 0,
            engagement_seconds: 0,
            resources: BTreeSet::new(),
            device: None,
        }
    }

    fn fold(&mut self, event: &RawEvent) -> Result<(), StageError> {
        let event_count = self
            .event_count
            .checked_add(1)
            .ok_or_else(|| overflow(format!("event count of session {}", event.session_id)))?;
        let engagement_seconds = self
            .engagement_seconds
            .checked_add(event.engagement_seconds.unwrap_or(0))
            .ok_or_else(|| {
                overflow(format!(
                    "engagement of session {} at seq {}",
                    event.session_id, event.seq
                ))
            })?;
        self.event_count = event_count;
        self.engagement_seconds = engagement_seconds;
        self.start = self.start.min(event.timestamp);
        self.end = self.end.max(event.timestamp);
        if let Some(resource) = event.resource_id {
            self.resources.insert(resource);
        }
        if let Some(device) = &event.device_type {
            let newer = self
                .device
                .as_ref()
                .map_or(true, |(ts, seq, _)| (event.timestamp, event.seq) > (*ts, *seq));
            if newer {
                self.device = Some((event.timestamp, event.seq, device.clone()));
            }
        }
        Ok(())
    }

    fn emit(&self, (session_id, member_id): &SessionKey) -> Session {
        Session {
            session_id: session_id.clone(),
            member_id: *member_id,
            session_start: self.start,
            session_end: self.end,
            event_count: self.event_count,
            total_engagement_seconds: self.engagement_seconds,
            resources_viewed: self.resources.iter().copied().collect(),
            device_type: self.device.as_ref().map(|(_, _, d)| d.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct Groups {
    by_key: BTreeMap<SessionKey, SessionAccumulator>,
}

impl Groups {
    /// Fold `events` into the groups, all or nothing.
    ///
    /// Touched accumulators are folded on scratch copies and merged back only
    /// once every event has folded, so an error leaves the groups unchanged.
    fn fold<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a RawEvent>,
    ) -> Result<usize, StageError> {
        let mut touched: BTreeMap<SessionKey, SessionAccumulator> = BTreeMap::new();
        let mut folded = 0;
        for event in events {
            let key = (event.session_id.clone(), event.member_id);
            let acc = match touched.entry(key) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => {
                    let acc = self
                        .by_key
                        .get(slot.key())
                        .cloned()
                        .unwrap_or_else(|| SessionAccumulator::open(event));
                    slot.insert(acc)
                }
            };
            acc.fold(event)?;
            folded += 1;
        }
        self.by_key.extend(touched);
        Ok(folded)
    }

    fn emit(&self) -> Vec<Session> {
        self.by_key.iter().map(|(key, acc)| acc.emit(key)).collect()
    }
}

/// Group events into sessions in one pass, ordered by `(session_id, member_id)`
///
/// # Errors
///
/// [`StageError::ResourceExhausted`] when a session counter overflows
pub fn sessionize<'a>(
    events: impl IntoIterator<Item = &'a RawEvent>,
) -> Result<Vec<Session>, StageError> {
    let mut groups = Groups::default();
    groups.fold(events)?;
    Ok(groups.emit())
}

#[derive(Debug, Default)]
struct SessionizerState {
    offset: usize,
    groups: Groups,
}

/// Incremental sessionizer stage operator
#[derive(Debug, Default)]
pub struct Sessionizer {
    state: Mutex<SessionizerState>,
}

impl Sessionizer {
    /// Fresh operator with no folded events
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `log` past the current offset and return all sessions
    ///
    /// A failed fold leaves the offset and the groups where they were, so the
    /// next refresh retries the same events against the same state.
    ///
    /// # Errors
    ///
    /// [`StageError::ResourceExhausted`] when a session counter overflows
    pub fn advance(&self, log: &EventLog) -> Result<Vec<Session>, StageError> {
        let mut state = self.state.lock();
        if log.len() < state.offset {
            tracing::warn!(
                offset = state.offset,
                log_len = log.len(),
                "event log shrank, rebuilding sessions"
            );
            *state = SessionizerState::default();
        }
        let offset = state.offset;
        let folded = state.groups.fold(log.iter_from(offset)).map_err(|err| {
            tracing::warn!(offset, error = %err, "sessions not advanced");
            err
        })?;
        state.offset = log.len();
        tracing::debug!(folded, groups = state.groups.by_key.len(), "sessions advanced");
        Ok(state.groups.emit())
    }
}

impl StageOperator for Sessionizer {
    fn recompute(&self, ctx: &RefreshContext) -> Result<Materialized, StageError> {
        let log = ctx.data::<EventLog>(RAW_EVENTS)?;
        Materialized::from_rows(self.advance(&log)?)
    }
}
