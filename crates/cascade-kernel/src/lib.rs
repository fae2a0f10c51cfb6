//! Cascade Kernel
//!
//! An incremental derived-table engine:
//! 1. **Registration**: sources and derived stages form a DAG; cycles are
//!    rejected at registration time
//! 2. **Refresh**: triggers become cycles that recompute stale stages in
//!    topological order and publish atomically versioned results
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cascade_kernel::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::default(), Arc::new(SystemClock))?;
//! let raw = engine.register_source("raw")?;
//! engine.register_stage(
//!     StageDefinition::new("doubled", |ctx: &RefreshContext| {
//!         let rows = ctx.rows::<u32>("raw")?;
//!         Materialized::from_rows(rows.iter().map(|n| n * 2).collect::<Vec<_>>())
//!     })
//!     .depends_on(["raw"]),
//! )?;
//!
//! engine.write_and_propagate(raw, Materialized::from_rows(vec![1u32, 2])?).await?;
//! ```

#![allow(missing_docs)]

pub mod clock;
pub mod config;
pub mod dag;
pub mod error;
mod executor;
pub mod history;
pub mod scheduler;
pub mod stage;
pub mod store;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::EngineConfig;
pub use error::{ConfigError, EngineError, EngineResult, StageError};
pub use history::{RefreshHistory, RefreshRecord, RefreshStatus};
pub use scheduler::{CycleReport, Engine, StageFailure, TableInfo, TickerHandle};
pub use stage::{RefreshContext, StageDefinition, StageOperator};
pub use store::{CommitOutcome, CommittedTable, Fingerprint, Materialized, TableData};
pub use types::{CycleId, RefreshPolicy, TableId, TableKind, Trigger, Version};

/// Common imports for building pipelines on the kernel
pub mod prelude {
    pub use crate::{
        Clock, CycleReport, Engine, EngineConfig, EngineError, FixedClock, Materialized,
        RefreshContext, RefreshPolicy, StageDefinition, StageError, SystemClock, TableId, Trigger,
    };
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
