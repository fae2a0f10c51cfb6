//! The engagement pipeline: an [`Engine`] with the five engagement stages
//! registered, an ingest buffer in front of `raw_events`, and typed reads of
//! every output table.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::{EventLog, IngestBuffer, IngestReport, IngestStats, RawEventRecord};
use crate::model::{
    DashboardSnapshot, EngagementDetailRow, Member, MemberSummary, Resource,
    ResourceCatalogEntry, Session,
};
use crate::producer::EventProducer;
use crate::query::{self, BreakdownRow, MemberQuery};
use crate::stages::{self, PipelineTables};
use cascade_kernel::{
    Clock, CycleReport, Engine, EngineError, Materialized, RefreshRecord, SystemClock, TableId,
    TableInfo, TickerHandle,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Member engagement pipeline
///
/// Cheap to clone; clones share the engine and the ingest buffer.
/// Writes made before [`Self::bootstrap`] are recorded but not propagated.
#[derive(Clone)]
pub struct EngagementPipeline {
    engine: Engine,
    config: PipelineConfig,
    tables: PipelineTables,
    buffer: Arc<IngestBuffer>,
    bootstrapped: Arc<AtomicBool>,
}

impl EngagementPipeline {
    /// Build the pipeline with an empty event log and empty reference data
    pub fn new(config: PipelineConfig, clock: Arc<dyn Clock>) -> PipelineResult<Self> {
        config.validate()?;
        let engine = Engine::new(config.engine.clone(), clock)?;
        let tables = stages::register(&engine, config.dashboard_interval())?;

        engine.write_source(tables.raw_events, EventLog::default().materialize())?;
        engine.write_source(tables.members, Materialized::from_rows(Vec::<Member>::new())?)?;
        engine.write_source(tables.resources, Materialized::from_rows(Vec::<Resource>::new())?)?;

        tracing::info!(
            dashboard_interval_secs = config.dashboard_interval_secs,
            workers = config.engine.max_concurrent_refreshes,
            auto_refresh = config.auto_refresh,
            "engagement pipeline created"
        );
        Ok(Self {
            engine,
            config,
            tables,
            buffer: Arc::new(IngestBuffer::new()),
            bootstrapped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Pipeline on the wall clock
    pub fn with_system_clock(config: PipelineConfig) -> PipelineResult<Self> {
        Self::new(config, Arc::new(SystemClock))
    }

    /// Underlying engine
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Table ids
    #[must_use]
    pub fn tables(&self) -> PipelineTables {
        self.tables
    }

    /// Every table in refresh order
    pub fn describe(&self) -> PipelineResult<Vec<TableInfo>> {
        Ok(self.engine.tables()?)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Validate and append raw events
    ///
    /// Rejected records are reported individually and never abort the batch.
    /// With auto-refresh on, accepted events are propagated before returning.
    pub async fn ingest(&self, records: &[RawEventRecord]) -> PipelineResult<IngestReport> {
        let raw_events = self.tables.raw_events;
        let engine = &self.engine;
        let appended = self.buffer.append(records, |log| {
            engine.write_source(raw_events, log.materialize()).map(|_| ())
        })?;

        if !appended.rejected.is_empty() {
            tracing::warn!(
                rejected = appended.rejected.len(),
                accepted = appended.accepted,
                first_reason = %appended.rejected[0].reason,
                "ingest rejected records"
            );
        }

        let refresh = if appended.accepted > 0 && self.propagates_writes() {
            Some(self.engine.sources_changed(&[raw_events]).await?)
        } else {
            None
        };

        Ok(IngestReport {
            accepted: appended.accepted,
            rejected: appended.rejected,
            total: appended.log.len(),
            refresh,
        })
    }

    /// Ingest every batch a producer yields
    pub async fn drain(
        &self,
        producer: &mut dyn EventProducer,
    ) -> PipelineResult<Vec<IngestReport>> {
        let mut reports = Vec::new();
        while let Some(batch) = producer.next_batch().await {
            reports.push(self.ingest(&batch).await?);
        }
        Ok(reports)
    }

    /// Replace the member dimension
    pub async fn load_members(&self, members: Vec<Member>) -> PipelineResult<Option<CycleReport>> {
        self.load_reference(self.tables.members, stages::MEMBERS, members, |m| m.member_id)
            .await
    }

    /// Replace the resource reference data
    pub async fn load_resources(
        &self,
        resources: Vec<Resource>,
    ) -> PipelineResult<Option<CycleReport>> {
        self.load_reference(self.tables.resources, stages::RESOURCES, resources, |r| {
            r.resource_id
        })
        .await
    }

    async fn load_reference<T, K>(
        &self,
        table: TableId,
        name: &'static str,
        mut rows: Vec<T>,
        key: impl Fn(&T) -> K,
    ) -> PipelineResult<Option<CycleReport>>
    where
        T: Serialize + Send + Sync + 'static,
        K: Ord + Hash + Display,
    {
        let mut seen = HashSet::with_capacity(rows.len());
        for row in &rows {
            let k = key(row);
            if seen.contains(&k) {
                return Err(PipelineError::DuplicateKey {
                    table: name,
                    key: k.to_string(),
                });
            }
            seen.insert(k);
        }
        rows.sort_by_key(|row| key(row));

        let count = rows.len();
        let outcome = self.engine.write_source(table, Materialized::from_rows(rows)?)?;
        tracing::info!(
            table = name,
            rows = count,
            changed = outcome.changed(),
            "reference data loaded"
        );

        if outcome.changed() && self.propagates_writes() {
            Ok(Some(self.engine.sources_changed(&[table]).await?))
        } else {
            Ok(None)
        }
    }

    // ------------------------------------------------------------------
    // Refresh control
    // ------------------------------------------------------------------

    fn propagates_writes(&self) -> bool {
        self.config.auto_refresh && self.bootstrapped.load(Ordering::Acquire)
    }

    /// Refresh every stage once, dashboard included
    pub async fn bootstrap(&self) -> PipelineResult<CycleReport> {
        let report = self.engine.bootstrap().await?;
        self.bootstrapped.store(true, Ordering::Release);
        Ok(report)
    }

    /// Propagate pending source changes
    ///
    /// Needed only when auto-refresh is off.
    pub async fn propagate(&self) -> PipelineResult<CycleReport> {
        let t = self.tables;
        Ok(self
            .engine
            .sources_changed(&[t.raw_events, t.members, t.resources])
            .await?)
    }

    /// Refresh the catalog and, when due, the dashboard
    pub async fn tick(&self) -> PipelineResult<CycleReport> {
        Ok(self.engine.tick().await?)
    }

    /// Force a refresh of one table by name and propagate downstream
    pub async fn refresh(&self, table: &str) -> PipelineResult<CycleReport> {
        let id = self.engine.table_id(table)?;
        Ok(self.engine.refresh(&[id]).await?)
    }

    /// Run [`Self::tick`] in the background every configured period
    #[must_use]
    pub fn spawn_ticker(&self) -> TickerHandle {
        self.engine.spawn_ticker(self.config.tick_period())
    }

    /// Stop refreshing a table
    pub fn suspend(&self, table: &str) -> PipelineResult<()> {
        let id = self.engine.table_id(table)?;
        Ok(self.engine.suspend(id)?)
    }

    /// Resume a suspended table
    pub fn resume(&self, table: &str) -> PipelineResult<()> {
        let id = self.engine.table_id(table)?;
        Ok(self.engine.resume(id)?)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current sessions
    pub fn sessions(&self) -> PipelineResult<Arc<Vec<Session>>> {
        Ok(self.engine.read_rows(self.tables.member_sessions)?)
    }

    /// Current enriched catalog
    pub fn catalog(&self) -> PipelineResult<Arc<Vec<ResourceCatalogEntry>>> {
        Ok(self.engine.read_rows(self.tables.resource_catalog)?)
    }

    /// Current detail facts
    pub fn detail(&self) -> PipelineResult<Arc<Vec<EngagementDetailRow>>> {
        Ok(self.engine.read_rows(self.tables.engagement_detail)?)
    }

    /// Every member summary, ordered by member id
    pub fn summaries(&self) -> PipelineResult<Arc<Vec<MemberSummary>>> {
        Ok(self.engine.read_rows(self.tables.member_engagement_summary)?)
    }

    /// Filtered, sorted and limited member summaries
    pub fn members(&self, query: &MemberQuery) -> PipelineResult<Vec<MemberSummary>> {
        Ok(query.apply(&self.summaries()?))
    }

    /// The dashboard row as of its last refresh
    pub fn dashboard(&self) -> PipelineResult<DashboardSnapshot> {
        let rows = match self
            .engine
            .read_rows::<DashboardSnapshot>(self.tables.engagement_dashboard)
        {
            Ok(rows) => rows,
            Err(EngineError::NotMaterialized(_)) => return Err(PipelineError::DashboardUnavailable),
            Err(err) => return Err(err.into()),
        };
        rows.first().cloned().ok_or(PipelineError::DashboardUnavailable)
    }

    /// Members per tier
    pub fn member_type_breakdown(&self) -> PipelineResult<Vec<BreakdownRow>> {
        Ok(query::by_member_type(&self.summaries()?))
    }

    /// Members per region
    pub fn region_breakdown(&self) -> PipelineResult<Vec<BreakdownRow>> {
        Ok(query::by_region(&self.summaries()?))
    }

    /// Refresh history of one table, most recent first
    pub fn refresh_history(&self, table: &str) -> PipelineResult<Vec<RefreshRecord>> {
        let id = self.engine.table_id(table)?;
        Ok(self.engine.history(id))
    }

    /// Refresh history of every table, most recent first
    #[must_use]
    pub fn refresh_history_all(&self) -> Vec<RefreshRecord> {
        self.engine.history_all()
    }

    /// Latest refresh attempt of every derived table, in refresh order
    pub fn last_refreshes(&self) -> PipelineResult<Vec<RefreshRecord>> {
        Ok(self
            .engine
            .refresh_order()?
            .into_iter()
            .filter_map(|id| self.engine.last_refresh(id))
            .collect())
    }

    /// Failed refresh attempts, most recent first
    #[must_use]
    pub fn failed_refreshes(&self) -> Vec<RefreshRecord> {
        self.engine.failed_refreshes()
    }

    /// The event log as committed to `raw_events`
    pub fn event_log(&self) -> PipelineResult<Arc<EventLog>> {
        Ok(self.engine.read_data(self.tables.raw_events)?)
    }

    /// Events in the buffer
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.buffer.len()
    }

    /// Cumulative ingest counters
    #[must_use]
    pub fn ingest_stats(&self) -> IngestStats {
        self.buffer.stats()
    }
}

impl std::fmt::Debug for EngagementPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngagementPipeline")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .field("events", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
