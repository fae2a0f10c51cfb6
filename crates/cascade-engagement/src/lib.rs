//! Cascade Engagement
//!
//! The member engagement pipeline on top of `cascade-kernel`:
//!
//! | table                       | kind    | refresh                     |
//! |-----------------------------|---------|-----------------------------|
//! | `raw_events`                | source  | ingest buffer               |
//! | `members`, `resources`      | source  | reference data loads        |
//! | `member_sessions`           | derived | reactive, incremental       |
//! | `resource_catalog`          | derived | reactive, every tick        |
//! | `engagement_detail`         | derived | reactive                    |
//! | `member_engagement_summary` | derived | reactive                    |
//! | `engagement_dashboard`      | derived | fixed interval              |
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cascade_engagement::prelude::*;
//!
//! let pipeline = EngagementPipeline::with_system_clock(PipelineConfig::default())?;
//! pipeline.load_members(members).await?;
//! pipeline.load_resources(resources).await?;
//! pipeline.bootstrap().await?;
//!
//! let report = pipeline.ingest(&records).await?;
//! let top = pipeline.members(&MemberQuery::top(10))?;
//! ```

#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod generator;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod producer;
pub mod query;
pub mod stages;
pub mod stats;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult, RejectReason};
pub use generator::{GeneratorConfig, SyntheticData, SyntheticFeed};
pub use ingest::{
    EventLog, IngestBuffer, IngestReport, IngestStats, RawEventRecord, RejectedRecord,
    MAX_ENGAGEMENT_SECONDS,
};
pub use model::{
    ContentCategory, DashboardSnapshot, EngagementDetailRow, EventType, Member, MemberId,
    MemberSummary, MemberTier, RawEvent, Resource, ResourceCatalogEntry, ResourceId, Session,
};
pub use pipeline::EngagementPipeline;
pub use producer::{BatchReplay, EventProducer};
pub use query::{BreakdownRow, MemberQuery, MemberSort};
pub use stages::PipelineTables;
pub use stats::{ModeCounter, Tenths};

/// Common imports for pipeline users
pub mod prelude {
    pub use crate::{
        DashboardSnapshot, EngagementPipeline, EventProducer, EventType, Member, MemberQuery,
        MemberSort, MemberSummary, MemberTier, PipelineConfig, PipelineError, RawEventRecord,
        Resource,
    };
}
