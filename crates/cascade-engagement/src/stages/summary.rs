//! Summary aggregator: one lifetime row per member.
//!
//! Detail rows repeat their session's counters once per resource, so
//! session-level sums are taken over distinct sessions only.

use super::{overflow, ENGAGEMENT_DETAIL};
use crate::model::{EngagementDetailRow, MemberId, MemberSummary, ResourceId};
use crate::stats::{ModeCounter, Tenths};
use cascade_kernel::{Materialized, RefreshContext, StageError, StageOperator};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug)]
struct MemberAccumulator<'a> {
    first: &'a EngagementDetailRow,
    sessions: BTreeMap<&'a str, &'a EngagementDetailRow>,
    resources: BTreeSet<ResourceId>,
    views: u64,
    topics: ModeCounter<&'a str>,
    content_types: ModeCounter<&'a str>,
}

impl<'a> MemberAccumulator<'a> {
    fn new(first: &'a EngagementDetailRow) -> Self {
        Self {
            first,
            sessions: BTreeMap::new(),
            resources: BTreeSet::new(),
            views: 0,
            topics: ModeCounter::new(),
            content_types: ModeCounter::new(),
        }
    }

    fn add(&mut self, row: &'a EngagementDetailRow) {
        self.sessions.entry(row.session_id.as_str()).or_insert(row);
        self.resources.insert(row.resource_id);
        self.views += 1;
        self.topics.add_opt(row.topic.as_deref());
        self.content_types.add_opt(row.content_type.as_deref());
    }

    fn finish(self) -> Result<MemberSummary, StageError> {
        let total_sessions = self.sessions.len() as u64;
        let (total_events, lifetime) = self
            .sessions
            .values()
            .try_fold((0_u64, 0_u64), |(events, seconds), s| {
                Some((
                    events.checked_add(s.event_count)?,
                    seconds.checked_add(s.total_engagement_seconds)?,
                ))
            })
            .ok_or_else(|| {
                overflow(format!("session totals of member {}", self.first.member_id))
            })?;
        let avg = Tenths::ratio(total_events, total_sessions).ok_or_else(|| {
            StageError::computation(format!(
                "member {} has no sessions to average over",
                self.first.member_id
            ))
        })?;
        let first_activity = self
            .sessions
            .values()
            .map(|s| s.session_start)
            .min()
            .unwrap_or(self.first.session_start);
        let last_activity = self
            .sessions
            .values()
            .map(|s| s.session_end)
            .max()
            .unwrap_or(self.first.session_end);

        Ok(MemberSummary {
            member_id: self.first.member_id,
            member_name: self.first.member_name.clone(),
            member_type: self.first.member_type,
            region: self.first.region.clone(),
            total_sessions,
            total_events,
            lifetime_engagement_seconds: lifetime,
            unique_resources: self.resources.len() as u64,
            total_resource_views: self.views,
            avg_events_per_session: avg,
            favorite_topic: self.topics.mode().map(str::to_string),
            preferred_content_type: self.content_types.mode().map(str::to_string),
            first_activity,
            last_activity,
        })
    }
}

/// Aggregate detail rows into member summaries ordered by member id
pub fn summarize(detail: &[EngagementDetailRow]) -> Result<Vec<MemberSummary>, StageError> {
    let mut members: BTreeMap<MemberId, MemberAccumulator<'_>> = BTreeMap::new();
    for row in detail {
        members
            .entry(row.member_id)
            .or_insert_with(|| MemberAccumulator::new(row))
            .add(row);
    }
    members.into_values().map(MemberAccumulator::finish).collect()
}

/// Summary aggregator stage operator
#[derive(Debug, Default, Clone, Copy)]
pub struct SummaryAggregator;

impl StageOperator for SummaryAggregator {
    fn recompute(&self, ctx: &RefreshContext) -> Result<Materialized, StageError> {
        let detail = ctx.rows::<EngagementDetailRow>(ENGAGEMENT_DETAIL)?;
        Materialized::from_rows(summarize(&detail)?)
    }
}
