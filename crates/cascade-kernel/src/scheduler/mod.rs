//! Refresh scheduler.
//!
//! The `Engine` owns the table registry, the dependency graph, the versioned
//! store and the refresh history. Each trigger becomes one refresh cycle:
//!
//! 1. Compute the roots of the trigger (changed sources, due interval stages,
//!    time-dependent stages, explicitly requested tables).
//! 2. Expand the roots to the cycle closure: every `Reactive` derived table
//!    reachable from a root through non-suspended tables. `Interval` tables
//!    join a cycle only as roots.
//! 3. Walk the closure in topological order, running every stage whose
//!    upstreams have committed in this cycle. Independent stages run
//!    concurrently on the shared worker pool.
//! 4. A failed stage halts propagation: its closure descendants are recorded
//!    as skipped, everything already committed stays committed.
//!
//! Dependency cycles are rejected when they are registered, never at refresh
//! time.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::dag::{Dag, GraphError};
use crate::error::{EngineError, EngineResult};
use crate::executor::{self, ExecutionEnv, StageRun, StageSlot, Upstream};
use crate::history::{RefreshHistory, RefreshRecord};
use crate::stage::StageDefinition;
use crate::store::{CommitOutcome, CommittedTable, Materialized, TableStore};
use crate::types::{CycleId, RefreshPolicy, TableId, TableKind, Trigger, Version};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Registry entry of any table
#[derive(Clone)]
struct TableEntry {
    id: TableId,
    name: String,
    kind: TableKind,
    stage: Option<Arc<StageSlot>>,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<TableId, TableEntry>,
    by_name: HashMap<String, TableId>,
}

struct EngineInner {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    dag: Dag,
    registry: RwLock<Registry>,
    store: TableStore,
    history: RefreshHistory,
    workers: Arc<Semaphore>,
    next_cycle: AtomicU64,
}

impl EngineInner {
    fn env(&self) -> ExecutionEnv<'_> {
        ExecutionEnv {
            clock: self.clock.as_ref(),
            store: &self.store,
            history: &self.history,
            workers: &self.workers,
        }
    }

    fn entry(&self, id: TableId) -> EngineResult<TableEntry> {
        self.registry
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTable(id.to_string()))
    }

    fn name_of(&self, id: TableId) -> String {
        self.registry
            .read()
            .by_id
            .get(&id)
            .map_or_else(|| id.to_string(), |e| e.name.clone())
    }

    fn upstreams(&self, id: TableId) -> Vec<Upstream> {
        self.dag
            .upstreams(id)
            .into_iter()
            .map(|up| Upstream {
                id: up,
                name: self.name_of(up),
            })
            .collect()
    }
}

/// Failure of one stage within a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Failed table
    pub table: String,
    /// Reason reported by the operator
    pub reason: String,
}

/// Summary of one refresh cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Cycle id
    pub cycle: CycleId,
    /// What started the cycle
    pub trigger: Trigger,
    /// Start time (engine clock)
    pub started_at: DateTime<Utc>,
    /// Wall duration in milliseconds
    pub duration_ms: u64,
    /// Recomputed tables that published a new version, in completion order
    pub refreshed: Vec<String>,
    /// Recomputed tables whose contents did not change
    pub unchanged: Vec<String>,
    /// Tables in the closure whose inputs had not moved
    pub up_to_date: Vec<String>,
    /// Failed stages
    pub failed: Vec<StageFailure>,
    /// Stages skipped because an upstream failed
    pub skipped: Vec<String>,
}

impl CycleReport {
    /// No stage failed or was skipped
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Whether `table` was recomputed (changed or not) in this cycle
    #[must_use]
    pub fn recomputed(&self, table: &str) -> bool {
        self.refreshed.iter().chain(&self.unchanged).any(|t| t == table)
    }

    /// Number of stages that ran their operator
    #[must_use]
    pub fn recomputed_count(&self) -> usize {
        self.refreshed.len() + self.unchanged.len() + self.failed.len()
    }
}

/// Description of a registered table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table id
    pub id: TableId,
    /// Table name
    pub name: String,
    /// Source or derived
    pub kind: TableKind,
    /// Refresh policy (derived tables only)
    pub policy: Option<RefreshPolicy>,
    /// Whether the output depends on the clock
    pub time_dependent: bool,
    /// Upstream table names
    pub upstreams: Vec<String>,
    /// Whether refreshes are suspended
    pub suspended: bool,
    /// Current committed version
    pub version: Version,
}

/// Incremental derived-table engine
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine, validating the configuration
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        config.validate()?;
        let inner = EngineInner {
            store: TableStore::new(config.retained_versions),
            history: RefreshHistory::new(config.history_capacity),
            workers: Arc::new(Semaphore::new(config.max_concurrent_refreshes)),
            config,
            clock,
            dag: Dag::new(),
            registry: RwLock::new(Registry::default()),
            next_cycle: AtomicU64::new(1),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Engine clock
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register an externally written table
    pub fn register_source(&self, name: impl Into<String>) -> EngineResult<TableId> {
        let name = name.into();
        let mut registry = self.inner.registry.write();
        if registry.by_name.contains_key(&name) {
            return Err(EngineError::DuplicateTable(name));
        }
        let id = TableId::next();
        self.inner.dag.add_node(id);
        registry.by_name.insert(name.clone(), id);
        registry.by_id.insert(
            id,
            TableEntry {
                id,
                name: name.clone(),
                kind: TableKind::Source,
                stage: None,
            },
        );
        tracing::debug!(table = %name, %id, "source registered");
        Ok(id)
    }

    /// Register a derived table
    ///
    /// Every upstream must already be registered.
    pub fn register_stage(&self, definition: StageDefinition) -> EngineResult<TableId> {
        let StageDefinition {
            name,
            upstreams,
            policy,
            time_dependent,
            operator,
        } = definition;

        let mut registry = self.inner.registry.write();
        if registry.by_name.contains_key(&name) {
            return Err(EngineError::DuplicateTable(name));
        }
        let mut upstream_ids = Vec::with_capacity(upstreams.len());
        for upstream in &upstreams {
            if *upstream == name {
                return Err(EngineError::SelfDependency(name));
            }
            let id = registry
                .by_name
                .get(upstream)
                .copied()
                .ok_or_else(|| EngineError::UnknownTable(upstream.clone()))?;
            upstream_ids.push(id);
        }

        let id = TableId::next();
        self.inner.dag.add_node(id);
        for upstream in &upstream_ids {
            // A fresh node has no outgoing edges, so only structural errors are possible.
            self.inner
                .dag
                .add_edge(*upstream, id)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }

        let slot = StageSlot::new(id, name.clone(), policy, time_dependent, operator);
        registry.by_name.insert(name.clone(), id);
        registry.by_id.insert(
            id,
            TableEntry {
                id,
                name: name.clone(),
                kind: TableKind::Derived,
                stage: Some(Arc::new(slot)),
            },
        );
        tracing::debug!(table = %name, %id, %policy, upstreams = ?upstreams, "stage registered");
        Ok(id)
    }

    /// Make `downstream` additionally depend on `upstream`
    ///
    /// Fails with `CycleDetected` if `upstream` already (transitively)
    /// depends on `downstream`.
    pub fn add_dependency(&self, downstream: TableId, upstream: TableId) -> EngineResult<()> {
        let down = self.inner.entry(downstream)?;
        let up = self.inner.entry(upstream)?;
        let Some(slot) = down.stage else {
            return Err(EngineError::SourceTable(down.name));
        };

        match self.inner.dag.add_edge(upstream, downstream) {
            Ok(()) => {}
            Err(GraphError::SelfLoop) => return Err(EngineError::SelfDependency(down.name)),
            Err(GraphError::CycleDetected) => {
                tracing::warn!(
                    downstream = %down.name,
                    upstream = %up.name,
                    "cyclic dependency rejected"
                );
                return Err(EngineError::CycleDetected {
                    downstream: down.name,
                    upstream: up.name,
                });
            }
            Err(GraphError::NodeNotFound) => return Err(EngineError::UnknownTable(up.name)),
        }

        if let Ok(mut state) = slot.state.try_lock() {
            state.force_next = true;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Id of a table by name
    pub fn table_id(&self, name: &str) -> EngineResult<TableId> {
        self.inner
            .registry
            .read()
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownTable(name.to_string()))
    }

    /// Name of a table by id
    pub fn table_name(&self, id: TableId) -> EngineResult<String> {
        self.inner.entry(id).map(|e| e.name)
    }

    /// Description of one table
    pub fn describe(&self, id: TableId) -> EngineResult<TableInfo> {
        let entry = self.inner.entry(id)?;
        Ok(TableInfo {
            id,
            name: entry.name.clone(),
            kind: entry.kind,
            policy: entry.stage.as_ref().map(|s| s.policy),
            time_dependent: entry.stage.as_ref().is_some_and(|s| s.time_dependent),
            upstreams: self.inner.upstreams(id).into_iter().map(|u| u.name).collect(),
            suspended: self.inner.dag.is_suspended(id),
            version: self.inner.store.current_version(id),
        })
    }

    /// All tables in refresh (topological) order
    pub fn tables(&self) -> EngineResult<Vec<TableInfo>> {
        self.refresh_order()?
            .into_iter()
            .map(|id| self.describe(id))
            .collect()
    }

    /// Topological order of all registered tables
    pub fn refresh_order(&self) -> EngineResult<Vec<TableId>> {
        self.inner
            .dag
            .topological_sort()
            .map_err(|e| EngineError::Internal(e.to_string()))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Latest committed version of a table
    #[must_use]
    pub fn read(&self, id: TableId) -> Option<Arc<CommittedTable>> {
        self.inner.store.latest(id)
    }

    /// A retained older version of a table
    #[must_use]
    pub fn read_version(&self, id: TableId, version: Version) -> Option<Arc<CommittedTable>> {
        self.inner.store.at_version(id, version)
    }

    /// Versions currently readable, oldest first
    #[must_use]
    pub fn versions(&self, id: TableId) -> Vec<Version> {
        self.inner.store.versions(id)
    }

    /// Typed rows of the latest committed version
    pub fn read_rows<T: Send + Sync + 'static>(&self, id: TableId) -> EngineResult<Arc<Vec<T>>> {
        let name = self.inner.name_of(id);
        self.inner.store.read_rows(id, &name)
    }

    /// Typed payload of the latest committed version
    pub fn read_data<T: Send + Sync + 'static>(&self, id: TableId) -> EngineResult<Arc<T>> {
        let name = self.inner.name_of(id);
        let committed = self
            .read(id)
            .ok_or_else(|| EngineError::NotMaterialized(name.clone()))?;
        committed
            .contents
            .downcast::<T>()
            .ok_or(EngineError::TypeMismatch {
                table: name,
                expected: std::any::type_name::<T>(),
            })
    }

    /// Refresh history of one table, most recent first
    #[must_use]
    pub fn history(&self, id: TableId) -> Vec<RefreshRecord> {
        self.inner.history.for_table(id)
    }

    /// Refresh history of all tables, most recent first
    #[must_use]
    pub fn history_all(&self) -> Vec<RefreshRecord> {
        self.inner.history.all()
    }

    /// Most recent refresh attempt of one table
    #[must_use]
    pub fn last_refresh(&self, id: TableId) -> Option<RefreshRecord> {
        self.inner.history.latest(id)
    }

    /// Failed refresh attempts across all tables, most recent first
    #[must_use]
    pub fn failed_refreshes(&self) -> Vec<RefreshRecord> {
        self.inner.history.failures()
    }

    // ------------------------------------------------------------------
    // Writes and control
    // ------------------------------------------------------------------

    /// Commit new contents to a source table without starting a cycle
    pub fn write_source(&self, id: TableId, contents: Materialized) -> EngineResult<CommitOutcome> {
        let entry = self.inner.entry(id)?;
        if entry.kind != TableKind::Source {
            return Err(EngineError::DerivedTable(entry.name));
        }
        let outcome = self.inner.store.commit(id, contents, self.inner.clock.now());
        tracing::debug!(
            table = %entry.name,
            version = %outcome.version(),
            changed = outcome.changed(),
            "source written"
        );
        Ok(outcome)
    }

    /// Commit to a source and propagate the change downstream
    ///
    /// Returns `None` when the contents were identical and nothing ran.
    pub async fn write_and_propagate(
        &self,
        id: TableId,
        contents: Materialized,
    ) -> EngineResult<Option<CycleReport>> {
        if self.write_source(id, contents)?.changed() {
            self.run(Trigger::SourcesChanged { tables: vec![id] })
                .await
                .map(Some)
        } else {
            Ok(None)
        }
    }

    /// Stop refreshing a derived table; propagation through it halts
    pub fn suspend(&self, id: TableId) -> EngineResult<()> {
        let entry = self.inner.entry(id)?;
        if entry.stage.is_none() {
            return Err(EngineError::SourceTable(entry.name));
        }
        self.inner
            .dag
            .suspend(id)
            .map_err(|_| EngineError::UnknownTable(entry.name.clone()))?;
        tracing::info!(table = %entry.name, "table suspended");
        Ok(())
    }

    /// Resume a suspended table; it refreshes on the next cycle reaching it
    pub fn resume(&self, id: TableId) -> EngineResult<()> {
        let entry = self.inner.entry(id)?;
        let Some(slot) = entry.stage else {
            return Err(EngineError::SourceTable(entry.name));
        };
        let was_suspended = self
            .inner
            .dag
            .resume(id)
            .map_err(|_| EngineError::UnknownTable(entry.name.clone()))?;
        if was_suspended {
            if let Ok(mut state) = slot.state.try_lock() {
                state.force_next = true;
            }
            tracing::info!(table = %entry.name, "table resumed");
        }
        Ok(())
    }

    /// Whether a table is suspended
    #[must_use]
    pub fn is_suspended(&self, id: TableId) -> bool {
        self.inner.dag.is_suspended(id)
    }

    // ------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------

    /// Refresh every non-suspended derived table once
    pub async fn bootstrap(&self) -> EngineResult<CycleReport> {
        self.run(Trigger::Bootstrap).await
    }

    /// Propagate changes of the given sources
    pub async fn sources_changed(&self, tables: &[TableId]) -> EngineResult<CycleReport> {
        self.run(Trigger::SourcesChanged {
            tables: tables.to_vec(),
        })
        .await
    }

    /// Refresh due interval stages and time-dependent stages
    pub async fn tick(&self) -> EngineResult<CycleReport> {
        self.run(Trigger::Tick).await
    }

    /// Force a refresh of specific tables and propagate downstream
    pub async fn refresh(&self, tables: &[TableId]) -> EngineResult<CycleReport> {
        self.run(Trigger::Manual {
            tables: tables.to_vec(),
        })
        .await
    }

    /// Run one refresh cycle
    pub async fn run(&self, trigger: Trigger) -> EngineResult<CycleReport> {
        let cycle = CycleId(self.inner.next_cycle.fetch_add(1, Ordering::Relaxed));
        let started_at = self.inner.clock.now();
        let timer = Instant::now();
        let plan = self.plan(&trigger, started_at)?;
        let label = trigger.label();

        tracing::info!(
            %cycle,
            trigger = label,
            stages = plan.order.len(),
            "refresh cycle started"
        );

        let mut report = CycleReport {
            cycle,
            trigger,
            started_at,
            duration_ms: 0,
            refreshed: Vec::new(),
            unchanged: Vec::new(),
            up_to_date: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        };

        self.execute(plan, cycle, label, &mut report).await?;

        report.duration_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);
        if report.is_success() {
            tracing::info!(
                %cycle,
                refreshed = report.refreshed.len(),
                unchanged = report.unchanged.len(),
                up_to_date = report.up_to_date.len(),
                duration_ms = report.duration_ms,
                "refresh cycle finished"
            );
        } else {
            tracing::warn!(
                %cycle,
                failed = ?report.failed,
                skipped = ?report.skipped,
                "refresh cycle finished with failures"
            );
        }
        Ok(report)
    }

    /// Compute the closure and order of a cycle
    fn plan(&self, trigger: &Trigger, now: DateTime<Utc>) -> EngineResult<CyclePlan> {
        let registry = self.inner.registry.read();
        let dag = &self.inner.dag;
        let stage = |id: &TableId| registry.by_id.get(id).and_then(|e| e.stage.clone());

        let mut forced: HashSet<TableId> = HashSet::new();
        let mut starts: Vec<TableId> = Vec::new();
        match trigger {
            Trigger::Bootstrap => {
                forced.extend(
                    registry
                        .by_id
                        .values()
                        .filter(|e| e.stage.is_some() && !dag.is_suspended(e.id))
                        .map(|e| e.id),
                );
            }
            Trigger::SourcesChanged { tables } => {
                for id in tables {
                    if !registry.by_id.contains_key(id) {
                        return Err(EngineError::UnknownTable(id.to_string()));
                    }
                    starts.push(*id);
                }
            }
            Trigger::Tick => {
                for entry in registry.by_id.values() {
                    let Some(slot) = &entry.stage else { continue };
                    if dag.is_suspended(entry.id) {
                        continue;
                    }
                    if slot.time_dependent || slot.interval_due(now) {
                        forced.insert(entry.id);
                    }
                }
            }
            Trigger::Manual { tables } => {
                for id in tables {
                    let entry = registry
                        .by_id
                        .get(id)
                        .ok_or_else(|| EngineError::UnknownTable(id.to_string()))?;
                    if entry.stage.is_some() {
                        if !dag.is_suspended(*id) {
                            forced.insert(*id);
                        }
                    } else {
                        starts.push(*id);
                    }
                }
            }
        }

        // Closure: forced roots plus reactive tables reachable through live tables.
        let mut members: HashSet<TableId> = forced.clone();
        let mut queue: VecDeque<TableId> = starts.iter().chain(forced.iter()).copied().collect();
        while let Some(node) = queue.pop_front() {
            for next in dag.downstreams(node) {
                if members.contains(&next) || dag.is_suspended(next) {
                    continue;
                }
                let Some(slot) = stage(&next) else { continue };
                if slot.policy.is_reactive() {
                    members.insert(next);
                    queue.push_back(next);
                }
            }
        }

        let order: Vec<TableId> = dag
            .topological_sort()
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .into_iter()
            .filter(|id| members.contains(id))
            .collect();

        let mut slots = HashMap::with_capacity(order.len());
        for id in &order {
            let slot = stage(id).ok_or_else(|| EngineError::UnknownTable(id.to_string()))?;
            slots.insert(*id, slot);
        }

        Ok(CyclePlan {
            order,
            forced,
            slots,
        })
    }

    /// Walk a plan, running ready stages concurrently
    async fn execute(
        &self,
        plan: CyclePlan,
        cycle: CycleId,
        label: &'static str,
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        let CyclePlan {
            order,
            forced,
            slots,
        } = plan;
        let members: HashSet<TableId> = order.iter().copied().collect();

        let mut pending: HashMap<TableId, usize> = HashMap::with_capacity(order.len());
        for id in &order {
            let within = self
                .inner
                .dag
                .upstreams(*id)
                .into_iter()
                .filter(|up| members.contains(up))
                .count();
            pending.insert(*id, within);
        }

        let mut ready: VecDeque<TableId> = order
            .iter()
            .filter(|id| pending.get(id) == Some(&0))
            .copied()
            .collect();
        let mut cancelled: HashSet<TableId> = HashSet::new();
        let mut running: JoinSet<(TableId, StageRun)> = JoinSet::new();

        loop {
            while let Some(id) = ready.pop_front() {
                let Some(slot) = slots.get(&id).cloned() else { continue };
                let inner = Arc::clone(&self.inner);
                let upstreams = inner.upstreams(id);
                let is_forced = forced.contains(&id);
                running.spawn(async move {
                    let run = executor::refresh_stage(
                        inner.env(),
                        &slot,
                        &upstreams,
                        cycle,
                        label,
                        is_forced,
                    )
                    .await;
                    (id, run)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (id, run) = joined.map_err(|e| EngineError::Internal(e.to_string()))?;
            let name = slots.get(&id).map_or_else(|| id.to_string(), |s| s.name.clone());

            match run {
                StageRun::Refreshed { changed: true } => report.refreshed.push(name),
                StageRun::Refreshed { changed: false } => report.unchanged.push(name),
                StageRun::UpToDate => report.up_to_date.push(name),
                StageRun::Failed { reason } => {
                    let doomed = self.closure_descendants(id, &members, &cancelled);
                    for skipped in doomed {
                        cancelled.insert(skipped);
                        if let Some(slot) = slots.get(&skipped) {
                            executor::skip_stage(self.inner.env(), slot, &name, cycle, label)
                                .await;
                            report.skipped.push(slot.name.clone());
                        }
                    }
                    report.failed.push(StageFailure {
                        table: name,
                        reason,
                    });
                    continue;
                }
            }

            for next in self.inner.dag.downstreams(id) {
                if cancelled.contains(&next) {
                    continue;
                }
                if let Some(count) = pending.get_mut(&next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }

        Ok(())
    }

    /// Members reachable from `failed` through other members of the cycle
    fn closure_descendants(
        &self,
        failed: TableId,
        members: &HashSet<TableId>,
        cancelled: &HashSet<TableId>,
    ) -> BTreeSet<TableId> {
        let mut doomed = BTreeSet::new();
        let mut queue = VecDeque::from([failed]);
        while let Some(node) = queue.pop_front() {
            for next in self.inner.dag.downstreams(node) {
                if members.contains(&next) && !cancelled.contains(&next) && doomed.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        doomed
    }

    // ------------------------------------------------------------------
    // Background ticking
    // ------------------------------------------------------------------

    /// Drive `tick()` every `period` until the handle is shut down
    pub fn spawn_ticker(&self, period: std::time::Duration) -> TickerHandle {
        let engine = self.clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = engine.tick().await {
                            tracing::error!(error = %err, "scheduled tick failed");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("ticker stopped");
        });
        TickerHandle {
            stop: stop_tx,
            task,
        }
    }
}

struct CyclePlan {
    order: Vec<TableId>,
    forced: HashSet<TableId>,
    slots: HashMap<TableId, Arc<StageSlot>>,
}

/// Handle to a background ticker
#[derive(Debug)]
pub struct TickerHandle {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl TickerHandle {
    /// Stop ticking and wait for an in-flight tick to finish
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("tables", &self.inner.dag.node_count())
            .field("dependencies", &self.inner.dag.edge_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::StageError;
    use crate::stage::RefreshContext;
    use chrono::TimeZone;

    fn engine() -> Engine {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        Engine::new(EngineConfig::default(), Arc::new(clock)).unwrap()
    }

    fn passthrough(
        upstream: &'static str,
    ) -> impl Fn(&RefreshContext) -> Result<Materialized, StageError> {
        move |ctx: &RefreshContext| {
            let rows = ctx.rows::<u32>(upstream)?;
            Materialized::from_rows(rows.as_ref().clone())
        }
    }

    #[test]
    fn registration_rejects_unknown_and_duplicate_tables() {
        let engine = engine();
        engine.register_source("a").unwrap();
        assert!(matches!(
            engine.register_source("a"),
            Err(EngineError::DuplicateTable(_))
        ));
        assert!(matches!(
            engine.register_stage(StageDefinition::new("b", passthrough("x")).depends_on(["x"])),
            Err(EngineError::UnknownTable(_))
        ));
        assert!(matches!(
            engine.register_stage(StageDefinition::new("c", passthrough("c")).depends_on(["c"])),
            Err(EngineError::SelfDependency(_))
        ));
    }

    #[test]
    fn sources_cannot_gain_dependencies() {
        let engine = engine();
        let a = engine.register_source("a").unwrap();
        let b = engine
            .register_stage(StageDefinition::new("b", passthrough("a")).depends_on(["a"]))
            .unwrap();
        assert!(matches!(
            engine.add_dependency(a, b),
            Err(EngineError::SourceTable(_))
        ));
    }

    #[tokio::test]
    async fn bootstrap_refreshes_everything_in_order() {
        let engine = engine();
        let a = engine.register_source("a").unwrap();
        engine
            .register_stage(StageDefinition::new("b", passthrough("a")).depends_on(["a"]))
            .unwrap();
        let c = engine
            .register_stage(StageDefinition::new("c", passthrough("b")).depends_on(["b"]))
            .unwrap();
        engine
            .write_source(a, Materialized::from_rows(vec![1u32, 2]).unwrap())
            .unwrap();

        let report = engine.bootstrap().await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.refreshed, vec!["b", "c"]);
        assert_eq!(*engine.read_rows::<u32>(c).unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn writing_a_derived_table_is_rejected() {
        let engine = engine();
        engine.register_source("a").unwrap();
        let b = engine
            .register_stage(StageDefinition::new("b", passthrough("a")).depends_on(["a"]))
            .unwrap();
        assert!(matches!(
            engine.write_source(b, Materialized::from_rows(vec![1u32]).unwrap()),
            Err(EngineError::DerivedTable(_))
        ));
    }
}
