//! Stage operators and their definitions.
//!
//! A stage is a derived table: an operator that turns the committed versions
//! of its upstreams into a new materialization. Operators run on the blocking
//! pool and must not assume anything about which thread calls them.

use crate::error::StageError;
use crate::store::{CommittedTable, Materialized};
use crate::types::{CycleId, RefreshPolicy};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Recompute logic of a derived table
pub trait StageOperator: Send + Sync + 'static {
    /// Produce the table's full contents from a consistent snapshot of its inputs
    fn recompute(&self, ctx: &RefreshContext) -> Result<Materialized, StageError>;
}

impl<F> StageOperator for F
where
    F: Fn(&RefreshContext) -> Result<Materialized, StageError> + Send + Sync + 'static,
{
    fn recompute(&self, ctx: &RefreshContext) -> Result<Materialized, StageError> {
        self(ctx)
    }
}

/// Everything a stage may read during one recompute
#[derive(Debug)]
pub struct RefreshContext {
    pub(crate) table_name: String,
    pub(crate) cycle: CycleId,
    pub(crate) now: DateTime<Utc>,
    pub(crate) inputs: HashMap<String, Arc<CommittedTable>>,
    pub(crate) previous: Option<Arc<CommittedTable>>,
}

impl RefreshContext {
    /// Build a context by hand (operator unit tests)
    #[must_use]
    pub fn new(table_name: impl Into<String>, cycle: CycleId, now: DateTime<Utc>) -> Self {
        Self {
            table_name: table_name.into(),
            cycle,
            now,
            inputs: HashMap::new(),
            previous: None,
        }
    }

    /// Attach an upstream snapshot
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, table: Arc<CommittedTable>) -> Self {
        self.inputs.insert(name.into(), table);
        self
    }

    /// Name of the table being refreshed
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Cycle this refresh belongs to
    #[must_use]
    pub fn cycle(&self) -> CycleId {
        self.cycle
    }

    /// Clock reading taken when the refresh started
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// This table's own currently committed version, if any
    #[must_use]
    pub fn previous(&self) -> Option<&Arc<CommittedTable>> {
        self.previous.as_ref()
    }

    /// Committed snapshot of an upstream
    pub fn input(&self, name: &str) -> Result<&Arc<CommittedTable>, StageError> {
        self.inputs
            .get(name)
            .ok_or_else(|| StageError::UndeclaredInput(name.to_string()))
    }

    /// Typed payload of an upstream
    pub fn data<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, StageError> {
        self.input(name)?
            .contents
            .downcast::<T>()
            .ok_or_else(|| StageError::InputType {
                table: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Typed rows of an upstream stored as `Vec<T>`
    pub fn rows<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<Vec<T>>, StageError> {
        self.data::<Vec<T>>(name)
    }
}

/// Registration record of a derived table
#[derive(Clone)]
pub struct StageDefinition {
    pub(crate) name: String,
    pub(crate) upstreams: Vec<String>,
    pub(crate) policy: RefreshPolicy,
    pub(crate) time_dependent: bool,
    pub(crate) operator: Arc<dyn StageOperator>,
}

impl StageDefinition {
    /// Reactive stage with no upstreams
    pub fn new(name: impl Into<String>, operator: impl StageOperator) -> Self {
        Self {
            name: name.into(),
            upstreams: Vec::new(),
            policy: RefreshPolicy::Reactive,
            time_dependent: false,
            operator: Arc::new(operator),
        }
    }

    /// Declare upstream tables by name
    #[must_use]
    pub fn depends_on<I, S>(mut self, upstreams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upstreams.extend(upstreams.into_iter().map(Into::into));
        self
    }

    /// Set the refresh policy
    #[must_use]
    pub fn policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Output depends on the clock; refreshed on every tick
    #[must_use]
    pub fn time_dependent(mut self) -> Self {
        self.time_dependent = true;
        self
    }

    /// Table name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("upstreams", &self.upstreams)
            .field("policy", &self.policy)
            .field("time_dependent", &self.time_dependent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TableId, Version};
    use chrono::TimeZone;

    fn committed(rows: Vec<u32>) -> Arc<CommittedTable> {
        Arc::new(CommittedTable {
            table: TableId::next(),
            version: Version(1),
            committed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            contents: Materialized::from_rows(rows).unwrap(),
        })
    }

    #[test]
    fn closures_are_operators() {
        let op = |ctx: &RefreshContext| {
            let rows = ctx.rows::<u32>("numbers")?;
            Materialized::from_rows(vec![rows.iter().sum::<u32>()])
        };
        let ctx = RefreshContext::new("total", CycleId(1), Utc::now())
            .with_input("numbers", committed(vec![1, 2, 3]));

        let out = op.recompute(&ctx).unwrap();
        assert_eq!(*out.downcast::<Vec<u32>>().unwrap(), vec![6]);
    }

    #[test]
    fn undeclared_and_mistyped_inputs_fail() {
        let ctx = RefreshContext::new("t", CycleId(1), Utc::now())
            .with_input("numbers", committed(vec![1]));

        assert!(matches!(
            ctx.rows::<u32>("other"),
            Err(StageError::UndeclaredInput(_))
        ));
        assert!(matches!(
            ctx.rows::<String>("numbers"),
            Err(StageError::InputType { .. })
        ));
    }
}
