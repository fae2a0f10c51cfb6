//! Detail joiner: sessions ⋈ members, fanned out per resource, ⋈ catalog.
//!
//! - sessions ⋈ members is an inner join; sessions of unknown members drop out
//! - each session expands into one row per viewed resource, so a session
//!   without resources contributes nothing
//! - resource ids ⋈ catalog is a left join; unknown ids keep `None` catalog fields

use super::{MEMBERS, MEMBER_SESSIONS, RESOURCE_CATALOG};
use crate::model::{
    EngagementDetailRow, Member, MemberId, ResourceCatalogEntry, ResourceId, Session,
};
use cascade_kernel::{Materialized, RefreshContext, StageError, StageOperator};
use std::collections::HashMap;

/// One `(session, resource)` pair of the fan-out
#[derive(Debug, Clone, Copy)]
pub struct Expanded<'a> {
    pub session: &'a Session,
    pub resource_id: ResourceId,
}

/// Expand a session into one item per viewed resource
pub fn expand(session: &Session) -> impl Iterator<Item = Expanded<'_>> {
    session
        .resources_viewed
        .iter()
        .map(move |&resource_id| Expanded {
            session,
            resource_id,
        })
}

/// Counters of one join, for logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub sessions_without_member: usize,
    pub sessions_without_resources: usize,
    pub unmatched_resources: usize,
}

/// Join sessions with members and the catalog
#[must_use]
pub fn join_detail(
    sessions: &[Session],
    members: &[Member],
    catalog: &[ResourceCatalogEntry],
) -> (Vec<EngagementDetailRow>, JoinStats) {
    let members: HashMap<MemberId, &Member> = members.iter().map(|m| (m.member_id, m)).collect();
    let catalog: HashMap<ResourceId, &ResourceCatalogEntry> =
        catalog.iter().map(|c| (c.resource_id, c)).collect();

    let mut stats = JoinStats::default();
    let mut rows = Vec::new();
    for session in sessions {
        let Some(member) = members.get(&session.member_id) else {
            stats.sessions_without_member += 1;
            continue;
        };
        if session.resources_viewed.is_empty() {
            stats.sessions_without_resources += 1;
        }
        for item in expand(session) {
            let entry = catalog.get(&item.resource_id).copied();
            if entry.is_none() {
                stats.unmatched_resources += 1;
            }
            rows.push(detail_row(item, member, entry));
        }
    }
    (rows, stats)
}

fn detail_row(
    item: Expanded<'_>,
    member: &Member,
    entry: Option<&ResourceCatalogEntry>,
) -> EngagementDetailRow {
    let session = item.session;
    EngagementDetailRow {
        session_id: session.session_id.clone(),
        member_id: session.member_id,
        member_name: member.member_name.clone(),
        member_type: member.member_type,
        region: member.region.clone(),
        session_start: session.session_start,
        session_end: session.session_end,
        event_count: session.event_count,
        total_engagement_seconds: session.total_engagement_seconds,
        device_type: session.device_type.clone(),
        resource_id: item.resource_id,
        title: entry.map(|c| c.title.clone()),
        content_type: entry.map(|c| c.content_type.clone()),
        topic: entry.map(|c| c.topic.clone()),
        difficulty: entry.map(|c| c.difficulty.clone()),
        content_category: entry.map(|c| c.content_category),
    }
}

/// Detail joiner stage operator
#[derive(Debug, Default, Clone, Copy)]
pub struct DetailJoiner;

impl StageOperator for DetailJoiner {
    fn recompute(&self, ctx: &RefreshContext) -> Result<Materialized, StageError> {
        let sessions = ctx.rows::<Session>(MEMBER_SESSIONS)?;
        let members = ctx.rows::<Member>(MEMBERS)?;
        let catalog = ctx.rows::<ResourceCatalogEntry>(RESOURCE_CATALOG)?;

        let (rows, stats) = join_detail(&sessions, &members, &catalog);
        if stats.sessions_without_member > 0 {
            tracing::warn!(
                dropped = stats.sessions_without_member,
                "sessions without a matching member dropped"
            );
        }
        tracing::debug!(
            rows = rows.len(),
            without_resources = stats.sessions_without_resources,
            unmatched_resources = stats.unmatched_resources,
            "detail joined"
        );
        Materialized::from_rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentCategory, MemberTier};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn session(id: &str, member: MemberId, resources: &[ResourceId]) -> Session {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        Session {
            session_id: id.into(),
            member_id: member,
            session_start: at,
            session_end: at,
            event_count: 1,
            total_engagement_seconds: 60,
            resources_viewed: resources.to_vec(),
            device_type: Some("mobile".into()),
        }
    }

    fn member(id: MemberId) -> Member {
        Member {
            member_id: id,
            member_name: format!("Member {id}"),
            member_type: MemberTier::Registered,
            region: "West".into(),
        }
    }

    fn entry(id: ResourceId) -> ResourceCatalogEntry {
        ResourceCatalogEntry {
            resource_id: id,
            title: format!("Resource {id}"),
            content_type: "video".into(),
            topic: "focus".into(),
            difficulty: "beginner".into(),
            publish_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            content_category: ContentCategory::Multimedia,
            days_since_publish: 60,
        }
    }

    #[test]
    fn fan_out_yields_one_row_per_resource() {
        let catalog = [entry(1), entry(2), entry(3)];
        let (rows, _) = join_detail(&[session("S", 1, &[1, 2, 3])], &[member(1)], &catalog);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.session_id == "S" && r.member_name == "Member 1"));
    }

    #[test]
    fn sessions_without_resources_produce_no_rows() {
        let (rows, stats) = join_detail(&[session("S", 1, &[])], &[member(1)], &[entry(1)]);
        assert!(rows.is_empty());
        assert_eq!(stats.sessions_without_resources, 1);
    }

    #[test]
    fn unknown_members_are_dropped() {
        let (rows, stats) = join_detail(&[session("S", 9, &[1])], &[member(1)], &[entry(1)]);
        assert!(rows.is_empty());
        assert_eq!(stats.sessions_without_member, 1);
    }

    #[test]
    fn unknown_resources_keep_empty_catalog_fields() {
        let (rows, stats) = join_detail(&[session("S", 1, &[1, 404])], &[member(1)], &[entry(1)]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].topic.as_deref(), Some("focus"));
        assert_eq!(rows[1].resource_id, 404);
        assert_eq!(rows[1].topic, None);
        assert_eq!(rows[1].content_category, None);
        assert_eq!(stats.unmatched_resources, 1);
    }
}
