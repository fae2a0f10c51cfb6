//! Stage operators of the engagement DAG and their registration.
//!
//! ```text
//! raw_events ──► member_sessions ───┐
//! members ──────────────────────────┼─► engagement_detail
//! resources ──► resource_catalog ───┘          │
//!                                              ▼
//!                                   member_engagement_summary
//!                                              │
//!                                              ▼
//!                                   engagement_dashboard (interval)
//! ```

pub mod enricher;
pub mod joiner;
pub mod kpi;
pub mod sessionizer;
pub mod summary;

pub use enricher::CatalogEnricher;
pub use joiner::DetailJoiner;
pub use kpi::KpiRoller;
pub use sessionizer::Sessionizer;
pub use summary::SummaryAggregator;

use cascade_kernel::{Engine, EngineResult, RefreshPolicy, StageDefinition, StageError, TableId};
use std::fmt;
use std::time::Duration;

pub const RAW_EVENTS: &str = "raw_events";
pub const MEMBERS: &str = "members";
pub const RESOURCES: &str = "resources";
pub const MEMBER_SESSIONS: &str = "member_sessions";
pub const RESOURCE_CATALOG: &str = "resource_catalog";
pub const ENGAGEMENT_DETAIL: &str = "engagement_detail";
pub const MEMBER_ENGAGEMENT_SUMMARY: &str = "member_engagement_summary";
pub const ENGAGEMENT_DASHBOARD: &str = "engagement_dashboard";

/// A u64 aggregate that no longer fits
pub(crate) fn overflow(what: impl fmt::Display) -> StageError {
    StageError::ResourceExhausted(format!("{what} overflowed"))
}

/// Ids of every table in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTables {
    pub raw_events: TableId,
    pub members: TableId,
    pub resources: TableId,
    pub member_sessions: TableId,
    pub resource_catalog: TableId,
    pub engagement_detail: TableId,
    pub member_engagement_summary: TableId,
    pub engagement_dashboard: TableId,
}

/// Register the three sources and five stages on `engine`
pub fn register(engine: &Engine, dashboard_interval: Duration) -> EngineResult<PipelineTables> {
    let raw_events = engine.register_source(RAW_EVENTS)?;
    let members = engine.register_source(MEMBERS)?;
    let resources = engine.register_source(RESOURCES)?;

    let member_sessions = engine.register_stage(
        StageDefinition::new(MEMBER_SESSIONS, Sessionizer::new()).depends_on([RAW_EVENTS]),
    )?;
    let resource_catalog = engine.register_stage(
        StageDefinition::new(RESOURCE_CATALOG, CatalogEnricher)
            .depends_on([RESOURCES])
            .time_dependent(),
    )?;
    let engagement_detail = engine.register_stage(
        StageDefinition::new(ENGAGEMENT_DETAIL, DetailJoiner).depends_on([
            MEMBER_SESSIONS,
            MEMBERS,
            RESOURCE_CATALOG,
        ]),
    )?;
    let member_engagement_summary = engine.register_stage(
        StageDefinition::new(MEMBER_ENGAGEMENT_SUMMARY, SummaryAggregator)
            .depends_on([ENGAGEMENT_DETAIL]),
    )?;
    let engagement_dashboard = engine.register_stage(
        StageDefinition::new(ENGAGEMENT_DASHBOARD, KpiRoller)
            .depends_on([MEMBER_ENGAGEMENT_SUMMARY])
            .policy(RefreshPolicy::every(dashboard_interval)),
    )?;

    Ok(PipelineTables {
        raw_events,
        members,
        resources,
        member_sessions,
        resource_catalog,
        engagement_detail,
        member_engagement_summary,
        engagement_dashboard,
    })
}
