//! KPI roller: the singleton dashboard row.
//!
//! Two independent folds run over the summary table, a scalar one and a
//! grouped one, and their results are merged into a single row.

use super::{overflow, MEMBER_ENGAGEMENT_SUMMARY};
use crate::model::{DashboardSnapshot, MemberSummary, MemberTier};
use crate::stats::{ModeCounter, Tenths};
use cascade_kernel::{Materialized, RefreshContext, StageError, StageOperator};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Ungrouped aggregates
#[derive(Debug, Default)]
struct ScalarFold<'a> {
    members: u64,
    sessions: u64,
    events: u64,
    engagement_seconds: u64,
    resource_views: u64,
    topics: ModeCounter<&'a str>,
    content_types: ModeCounter<&'a str>,
}

impl<'a> ScalarFold<'a> {
    fn add(&mut self, summary: &'a MemberSummary) -> Result<(), StageError> {
        let total = |acc: u64, value: u64, what: &str| {
            acc.checked_add(value).ok_or_else(|| overflow(format!("dashboard {what}")))
        };
        let members = total(self.members, 1, "members")?;
        let sessions = total(self.sessions, summary.total_sessions, "sessions")?;
        let events = total(self.events, summary.total_events, "events")?;
        let engagement_seconds = total(
            self.engagement_seconds,
            summary.lifetime_engagement_seconds,
            "engagement seconds",
        )?;
        let resource_views = total(
            self.resource_views,
            summary.total_resource_views,
            "resource views",
        )?;

        self.members = members;
        self.sessions = sessions;
        self.events = events;
        self.engagement_seconds = engagement_seconds;
        self.resource_views = resource_views;
        self.topics.add_opt(summary.favorite_topic.as_deref());
        self.content_types
            .add_opt(summary.preferred_content_type.as_deref());
        Ok(())
    }
}

/// Member counts per tier and per region
#[derive(Debug, Default)]
struct GroupedFold {
    by_tier: BTreeMap<MemberTier, u64>,
    by_region: BTreeMap<String, u64>,
}

impl GroupedFold {
    fn add(&mut self, summary: &MemberSummary) {
        *self.by_tier.entry(summary.member_type).or_insert(0) += 1;
        *self.by_region.entry(summary.region.clone()).or_insert(0) += 1;
    }

    fn tier(&self, tier: MemberTier) -> u64 {
        self.by_tier.get(&tier).copied().unwrap_or(0)
    }
}

/// Build the dashboard row from member summaries
///
/// # Errors
///
/// [`StageError::ResourceExhausted`] when a dashboard total overflows
pub fn roll_up(
    summaries: &[MemberSummary],
    generated_at: DateTime<Utc>,
) -> Result<DashboardSnapshot, StageError> {
    let scalar = summaries.iter().try_fold(ScalarFold::default(), |mut fold, s| {
        fold.add(s)?;
        Ok::<_, StageError>(fold)
    })?;
    let grouped = summaries.iter().fold(GroupedFold::default(), |mut fold, s| {
        fold.add(s);
        fold
    });

    let member_minutes = scalar
        .members
        .checked_mul(60)
        .ok_or_else(|| overflow("dashboard member minutes"))?;

    Ok(DashboardSnapshot {
        active_members: scalar.members,
        total_sessions: scalar.sessions,
        total_events: scalar.events,
        total_engagement_seconds: scalar.engagement_seconds,
        total_engagement_hours: Tenths::ratio_or_zero(scalar.engagement_seconds, 3600),
        avg_engagement_minutes_per_member: Tenths::ratio_or_zero(
            scalar.engagement_seconds,
            member_minutes,
        ),
        avg_sessions_per_member: Tenths::ratio_or_zero(scalar.sessions, scalar.members),
        total_resource_views: scalar.resource_views,
        premium_members: grouped.tier(MemberTier::Premium),
        registered_members: grouped.tier(MemberTier::Registered),
        free_members: grouped.tier(MemberTier::Free),
        top_topic: scalar.topics.mode().map(str::to_string),
        top_content_type: scalar.content_types.mode().map(str::to_string),
        members_by_tier: grouped.by_tier,
        members_by_region: grouped.by_region,
        report_generated_at: generated_at,
    })
}

/// KPI roller stage operator
#[derive(Debug, Default, Clone, Copy)]
pub struct KpiRoller;

impl StageOperator for KpiRoller {
    fn recompute(&self, ctx: &RefreshContext) -> Result<Materialized, StageError> {
        let summaries = ctx.rows::<MemberSummary>(MEMBER_ENGAGEMENT_SUMMARY)?;
        Materialized::from_rows(vec![roll_up(&summaries, ctx.now())?])
    }
}
