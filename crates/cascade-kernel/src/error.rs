//! Error types for the Cascade kernel
//!
//! Two families:
//! - `EngineError`: registration, scheduling and read errors surfaced to callers
//! - `StageError`: a single stage's recompute failed; recorded in refresh
//!   history and halts propagation for the cycle

use thiserror::Error;

/// Engine-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// No table registered under that name or id
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A table with that name is already registered
    #[error("table already registered: {0}")]
    DuplicateTable(String),

    /// The dependency would close a cycle
    #[error("cycle detected: {downstream} cannot depend on {upstream}")]
    CycleDetected {
        /// Table that would gain the dependency
        downstream: String,
        /// Proposed upstream
        upstream: String,
    },

    /// A table listed itself as an upstream
    #[error("table {0} cannot depend on itself")]
    SelfDependency(String),

    /// Sources have no upstreams and no operator
    #[error("{0} is a source table")]
    SourceTable(String),

    /// Derived tables cannot be written directly
    #[error("{0} is a derived table and cannot be written")]
    DerivedTable(String),

    /// Nothing has been committed for this table yet
    #[error("table {0} has not been materialized")]
    NotMaterialized(String),

    /// Committed data is not of the requested row type
    #[error("table {table} does not hold {expected}")]
    TypeMismatch {
        /// Table name
        table: String,
        /// Requested Rust type
        expected: &'static str,
    },

    /// Invalid engine configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A refresh task could not be joined
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Errors raised while building the DAG (as opposed to reading/refreshing)
    #[must_use]
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTable(_)
                | Self::CycleDetected { .. }
                | Self::SelfDependency(_)
                | Self::SourceTable(_)
        )
    }
}

/// A stage recompute failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// An upstream has never been committed
    #[error("upstream {0} is not materialized")]
    MissingInput(String),

    /// The stage was handed an input it did not declare
    #[error("{0} is not an upstream of this stage")]
    UndeclaredInput(String),

    /// Upstream data is not of the expected row type
    #[error("upstream {table} does not hold {expected}")]
    InputType {
        /// Upstream table name
        table: String,
        /// Expected Rust type
        expected: &'static str,
    },

    /// Arithmetic or data error inside the operator
    #[error("computation failed: {0}")]
    Computation(String),

    /// A row or memory bound was exceeded
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Output could not be encoded for fingerprinting
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// The operator panicked
    #[error("operator panicked: {0}")]
    Panicked(String),
}

impl StageError {
    /// Build a computation error
    pub fn computation(message: impl Into<String>) -> Self {
        Self::Computation(message.into())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// The configuration file could not be read
    #[error("cannot read {path}: {reason}")]
    Io {
        /// File path
        path: String,
        /// OS error text
        reason: String,
    },

    /// The configuration file is not valid TOML for this schema
    #[error("cannot parse configuration: {0}")]
    Parse(String),
}

/// Result alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
