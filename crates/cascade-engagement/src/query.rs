//! Point-in-time queries over the summary table.

use crate::model::{MemberSummary, MemberTier};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Ordering of member query results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberSort {
    /// Most lifetime engagement first
    #[default]
    EngagementDesc,
    /// Most sessions first
    SessionsDesc,
    /// Most recently active first
    LastActivityDesc,
    /// Alphabetical by name
    Name,
}

/// Filter, sort and limit over member summaries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberQuery {
    pub member_type: Option<MemberTier>,
    pub region: Option<String>,
    pub sort: MemberSort,
    pub limit: Option<usize>,
}

impl MemberQuery {
    /// All members, most engaged first
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Top `n` members by lifetime engagement
    #[must_use]
    pub fn top(n: usize) -> Self {
        Self::new().limit(n)
    }

    /// Only members of `tier`
    #[must_use]
    pub fn member_type(mut self, tier: MemberTier) -> Self {
        self.member_type = Some(tier);
        self
    }

    /// Only members in `region`
    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Result ordering
    #[must_use]
    pub fn sort(mut self, sort: MemberSort) -> Self {
        self.sort = sort;
        self
    }

    /// At most `n` rows
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    fn matches(&self, row: &MemberSummary) -> bool {
        self.member_type.map_or(true, |t| row.member_type == t)
            && self.region.as_deref().map_or(true, |r| row.region == r)
    }

    fn compare(&self, a: &MemberSummary, b: &MemberSummary) -> Ordering {
        let primary = match self.sort {
            MemberSort::EngagementDesc => b
                .lifetime_engagement_seconds
                .cmp(&a.lifetime_engagement_seconds),
            MemberSort::SessionsDesc => b.total_sessions.cmp(&a.total_sessions),
            MemberSort::LastActivityDesc => b.last_activity.cmp(&a.last_activity),
            MemberSort::Name => a.member_name.cmp(&b.member_name),
        };
        primary.then(a.member_id.cmp(&b.member_id))
    }

    /// Run the query
    #[must_use]
    pub fn apply(&self, rows: &[MemberSummary]) -> Vec<MemberSummary> {
        let mut matched: Vec<MemberSummary> =
            rows.iter().filter(|r| self.matches(r)).cloned().collect();
        matched.sort_by(|a, b| self.compare(a, b));
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Member count of one category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakdownRow {
    pub key: String,
    pub count: u64,
}

/// Members per tier, in tier order, including empty tiers
#[must_use]
pub fn by_member_type(rows: &[MemberSummary]) -> Vec<BreakdownRow> {
    MemberTier::ALL
        .into_iter()
        .map(|tier| BreakdownRow {
            key: tier.to_string(),
            count: rows.iter().filter(|r| r.member_type == tier).count() as u64,
        })
        .collect()
}

/// Members per region, alphabetical
#[must_use]
pub fn by_region(rows: &[MemberSummary]) -> Vec<BreakdownRow> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for row in rows {
        *counts.entry(row.region.as_str()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(region, count)| BreakdownRow {
            key: region.to_string(),
            count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Tenths;
    use chrono::{TimeZone, Utc};

    fn summary(id: u64, name: &str, tier: MemberTier, region: &str, secs: u64) -> MemberSummary {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
            + chrono::Duration::hours(id as i64);
        MemberSummary {
            member_id: id,
            member_name: name.into(),
            member_type: tier,
            region: region.into(),
            total_sessions: id,
            total_events: id,
            lifetime_engagement_seconds: secs,
            unique_resources: 1,
            total_resource_views: 1,
            avg_events_per_session: Tenths(10),
            favorite_topic: None,
            preferred_content_type: None,
            first_activity: at,
            last_activity: at,
        }
    }

    fn rows() -> Vec<MemberSummary> {
        vec![
            summary(1, "Casey", MemberTier::Free, "West", 300),
            summary(2, "Alex", MemberTier::Premium, "West", 900),
            summary(3, "Blake", MemberTier::Premium, "Midwest", 900),
            summary(4, "Drew", MemberTier::Registered, "Midwest", 100),
        ]
    }

    fn ids(rows: &[MemberSummary]) -> Vec<u64> {
        rows.iter().map(|r| r.member_id).collect()
    }

    #[test]
    fn default_sort_is_engagement_then_id() {
        assert_eq!(ids(&MemberQuery::new().apply(&rows())), vec![2, 3, 1, 4]);
        assert_eq!(ids(&MemberQuery::top(2).apply(&rows())), vec![2, 3]);
    }

    #[test]
    fn filters_combine() {
        let query = MemberQuery::new().member_type(MemberTier::Premium).region("West");
        assert_eq!(ids(&query.apply(&rows())), vec![2]);
    }

    #[test]
    fn other_sort_orders() {
        let by_name = MemberQuery::new().sort(MemberSort::Name).apply(&rows());
        assert_eq!(ids(&by_name), vec![2, 3, 1, 4]);
        let recent = MemberQuery::new().sort(MemberSort::LastActivityDesc).apply(&rows());
        assert_eq!(ids(&recent), vec![4, 3, 2, 1]);
    }

    #[test]
    fn breakdowns_count_members() {
        let tiers = by_member_type(&rows());
        assert_eq!(
            tiers,
            vec![
                BreakdownRow { key: "free".into(), count: 1 },
                BreakdownRow { key: "registered".into(), count: 1 },
                BreakdownRow { key: "premium".into(), count: 2 },
            ]
        );
        let regions = by_region(&rows());
        assert_eq!(regions[0], BreakdownRow { key: "Midwest".into(), count: 2 });
        assert_eq!(regions[1], BreakdownRow { key: "West".into(), count: 2 });
    }
}
