//! Single-stage refresh.
//!
//! The executor owns one stage refresh end to end: it takes the stage's
//! refresh lock, snapshots the committed version of every upstream, decides
//! whether the stage is stale, runs the operator on the blocking pool under a
//! worker permit, commits the result and records history.
//!
//! # Invariants
//!
//! - A stage never observes a partially written upstream: inputs are
//!   `Arc<CommittedTable>` snapshots taken before the operator runs.
//! - At most one refresh of a given stage runs at a time, across all cycles.

use crate::clock::Clock;
use crate::error::StageError;
use crate::history::{RefreshHistory, RefreshRecord, RefreshStatus};
use crate::stage::{RefreshContext, StageOperator};
use crate::store::{CommittedTable, TableStore};
use crate::types::{CycleId, RefreshPolicy, TableId, Version};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};

/// Mutable refresh bookkeeping of a derived table
#[derive(Debug, Default)]
pub(crate) struct StageState {
    /// Upstream versions read by the last successful refresh
    pub(crate) consumed: HashMap<TableId, Version>,
    /// Set after a failure, a skip, a resume or a new dependency
    pub(crate) force_next: bool,
    /// Whether the stage has ever refreshed successfully
    pub(crate) refreshed_once: bool,
}

/// Registered derived table as seen by the executor
pub(crate) struct StageSlot {
    pub(crate) id: TableId,
    pub(crate) name: String,
    pub(crate) policy: RefreshPolicy,
    pub(crate) time_dependent: bool,
    pub(crate) operator: Arc<dyn StageOperator>,
    pub(crate) state: Mutex<StageState>,
    pub(crate) last_started: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl StageSlot {
    pub(crate) fn new(
        id: TableId,
        name: String,
        policy: RefreshPolicy,
        time_dependent: bool,
        operator: Arc<dyn StageOperator>,
    ) -> Self {
        Self {
            id,
            name,
            policy,
            time_dependent,
            operator,
            state: Mutex::new(StageState::default()),
            last_started: parking_lot::Mutex::new(None),
        }
    }

    /// Interval stage whose period has elapsed at `now`
    pub(crate) fn interval_due(&self, now: DateTime<Utc>) -> bool {
        let RefreshPolicy::Interval { every } = self.policy else {
            return false;
        };
        match *self.last_started.lock() {
            None => true,
            Some(last) => chrono::Duration::from_std(every)
                .map(|every| now - last >= every)
                .unwrap_or(false),
        }
    }
}

/// What happened to one stage within a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StageRun {
    /// Recomputed and committed
    Refreshed { changed: bool },
    /// Inputs unchanged since the last successful refresh
    UpToDate,
    /// Recompute failed
    Failed { reason: String },
}

/// Shared handles the executor needs from the engine
pub(crate) struct ExecutionEnv<'a> {
    pub(crate) clock: &'a dyn Clock,
    pub(crate) store: &'a TableStore,
    pub(crate) history: &'a RefreshHistory,
    pub(crate) workers: &'a Arc<Semaphore>,
}

/// Upstream of a stage, resolved to id and name
#[derive(Debug, Clone)]
pub(crate) struct Upstream {
    pub(crate) id: TableId,
    pub(crate) name: String,
}

/// Refresh one stage
///
/// `forced` stages recompute even when their inputs did not move.
pub(crate) async fn refresh_stage(
    env: ExecutionEnv<'_>,
    slot: &StageSlot,
    upstreams: &[Upstream],
    cycle: CycleId,
    trigger: &str,
    forced: bool,
) -> StageRun {
    let mut state = slot.state.lock().await;

    let mut snapshot: Vec<(Upstream, Arc<CommittedTable>)> = Vec::with_capacity(upstreams.len());
    let mut missing = None;
    for upstream in upstreams {
        match env.store.latest(upstream.id) {
            Some(committed) => snapshot.push((upstream.clone(), committed)),
            None => {
                missing = Some(upstream.name.clone());
                break;
            }
        }
    }

    let stale = forced
        || state.force_next
        || !state.refreshed_once
        || snapshot
            .iter()
            .any(|(up, table)| state.consumed.get(&up.id) != Some(&table.version));
    if !stale && missing.is_none() {
        tracing::debug!(stage = %slot.name, %cycle, "stage up to date");
        return StageRun::UpToDate;
    }

    let Ok(_permit) = Arc::clone(env.workers).acquire_owned().await else {
        return StageRun::Failed {
            reason: "worker pool closed".into(),
        };
    };

    let started_at = env.clock.now();
    *slot.last_started.lock() = Some(started_at);
    let timer = Instant::now();
    tracing::debug!(stage = %slot.name, %cycle, trigger, "stage refresh started");

    let result = match missing {
        Some(name) => Err(StageError::MissingInput(name)),
        None => {
            let ctx = RefreshContext {
                table_name: slot.name.clone(),
                cycle,
                now: started_at,
                inputs: snapshot
                    .iter()
                    .map(|(up, table)| (up.name.clone(), Arc::clone(table)))
                    .collect(),
                previous: env.store.latest(slot.id),
            };
            let operator = Arc::clone(&slot.operator);
            match tokio::task::spawn_blocking(move || operator.recompute(&ctx)).await {
                Ok(result) => result,
                Err(join) => Err(StageError::Panicked(join.to_string())),
            }
        }
    };

    let duration_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);
    let ended_at = env.clock.now();

    let (run, status, rows, version, data_changed) = match result {
        Ok(contents) => {
            let rows = contents.row_count();
            let outcome = env.store.commit(slot.id, contents, ended_at);
            state.consumed = snapshot
                .iter()
                .map(|(up, table)| (up.id, table.version))
                .collect();
            state.force_next = false;
            state.refreshed_once = true;
            tracing::info!(
                stage = %slot.name,
                %cycle,
                rows,
                version = %outcome.version(),
                changed = outcome.changed(),
                duration_ms,
                "stage refreshed"
            );
            (
                StageRun::Refreshed {
                    changed: outcome.changed(),
                },
                RefreshStatus::Succeeded,
                rows,
                outcome.version(),
                outcome.changed(),
            )
        }
        Err(err) => {
            state.force_next = true;
            let reason = err.to_string();
            tracing::warn!(stage = %slot.name, %cycle, error = %reason, "stage refresh failed");
            let current = env.store.latest(slot.id);
            (
                StageRun::Failed {
                    reason: reason.clone(),
                },
                RefreshStatus::Failed { reason },
                current.as_ref().map_or(0, |t| t.contents.row_count()),
                current.map_or(Version::NONE, |t| t.version),
                false,
            )
        }
    };

    env.history.record(RefreshRecord {
        table: slot.id,
        table_name: slot.name.clone(),
        cycle,
        trigger: trigger.to_string(),
        started_at,
        ended_at,
        duration_ms,
        status,
        rows,
        version,
        data_changed,
    });

    run
}

/// Record that a stage was skipped because `upstream` failed
pub(crate) async fn skip_stage(
    env: ExecutionEnv<'_>,
    slot: &StageSlot,
    upstream: &str,
    cycle: CycleId,
    trigger: &str,
) {
    slot.state.lock().await.force_next = true;
    let now = env.clock.now();
    let current = env.store.latest(slot.id);
    tracing::warn!(stage = %slot.name, %cycle, upstream, "stage skipped after upstream failure");
    env.history.record(RefreshRecord {
        table: slot.id,
        table_name: slot.name.clone(),
        cycle,
        trigger: trigger.to_string(),
        started_at: now,
        ended_at: now,
        duration_ms: 0,
        status: RefreshStatus::Skipped {
            upstream: upstream.to_string(),
        },
        rows: current.as_ref().map_or(0, |t| t.contents.row_count()),
        version: current.map_or(Version::NONE, |t| t.version),
        data_changed: false,
    });
}

