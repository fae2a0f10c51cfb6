//! Row types of every table in the engagement pipeline.

use crate::stats::Tenths;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Member identifier
pub type MemberId = u64;

/// Resource identifier
pub type ResourceId = u64;

/// Kind of member interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    View,
    Start,
    Complete,
    Download,
    Share,
    Bookmark,
}

impl EventType {
    /// All event types
    pub const ALL: [EventType; 6] = [
        Self::View,
        Self::Start,
        Self::Complete,
        Self::Download,
        Self::Share,
        Self::Bookmark,
    ];

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Download => "download",
            Self::Share => "share",
            Self::Bookmark => "bookmark",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated, immutable interaction event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Ingest sequence number, global insertion order
    pub seq: u64,
    pub member_id: MemberId,
    pub session_id: String,
    pub resource_id: Option<ResourceId>,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub engagement_seconds: Option<u64>,
    pub device_type: Option<String>,
}

/// One session: all events sharing `(session_id, member_id)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub member_id: MemberId,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
    pub event_count: u64,
    pub total_engagement_seconds: u64,
    /// Distinct resources, ascending
    pub resources_viewed: Vec<ResourceId>,
    /// Device of the latest event that reported one
    pub device_type: Option<String>,
}

/// Membership tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberTier {
    Free,
    Registered,
    Premium,
}

impl MemberTier {
    /// Tiers in presentation order
    pub const ALL: [MemberTier; 3] = [Self::Free, Self::Registered, Self::Premium];

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Registered => "registered",
            Self::Premium => "premium",
        }
    }
}

impl FromStr for MemberTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown member type {s:?}"))
    }
}

impl fmt::Display for MemberTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Member dimension row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub member_id: MemberId,
    pub member_name: String,
    pub member_type: MemberTier,
    pub region: String,
}

/// Resource reference row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: ResourceId,
    pub title: String,
    pub content_type: String,
    pub topic: String,
    pub difficulty: String,
    pub publish_date: NaiveDate,
}

/// Coarse bucket of a resource's content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    Multimedia,
    Reading,
    Interactive,
}

impl ContentCategory {
    /// Bucket a content type; anything unrecognized is interactive
    #[must_use]
    pub fn classify(content_type: &str) -> Self {
        match content_type.trim().to_ascii_lowercase().as_str() {
            "video" | "webinar" | "podcast" => Self::Multimedia,
            "article" | "guide" | "worksheet" | "ebook" => Self::Reading,
            _ => Self::Interactive,
        }
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Multimedia => "multimedia",
            Self::Reading => "reading",
            Self::Interactive => "interactive",
        }
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource with derived catalog attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCatalogEntry {
    pub resource_id: ResourceId,
    pub title: String,
    pub content_type: String,
    pub topic: String,
    pub difficulty: String,
    pub publish_date: NaiveDate,
    pub content_category: ContentCategory,
    /// Whole days between the publish date and the refresh date
    pub days_since_publish: i64,
}

/// One `(session, resource)` fact, fully denormalized
///
/// Catalog fields are `None` when the resource id has no catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementDetailRow {
    pub session_id: String,
    pub member_id: MemberId,
    pub member_name: String,
    pub member_type: MemberTier,
    pub region: String,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
    pub event_count: u64,
    pub total_engagement_seconds: u64,
    pub device_type: Option<String>,
    pub resource_id: ResourceId,
    pub title: Option<String>,
    pub content_type: Option<String>,
    pub topic: Option<String>,
    pub difficulty: Option<String>,
    pub content_category: Option<ContentCategory>,
}

/// Lifetime engagement of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub member_id: MemberId,
    pub member_name: String,
    pub member_type: MemberTier,
    pub region: String,
    pub total_sessions: u64,
    pub total_events: u64,
    pub lifetime_engagement_seconds: u64,
    pub unique_resources: u64,
    pub total_resource_views: u64,
    pub avg_events_per_session: Tenths,
    pub favorite_topic: Option<String>,
    pub preferred_content_type: Option<String>,
    pub first_activity: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl MemberSummary {
    /// Lifetime engagement in minutes, one decimal
    #[must_use]
    pub fn engagement_minutes(&self) -> Tenths {
        Tenths::ratio_or_zero(self.lifetime_engagement_seconds, 60)
    }
}

/// Organization-wide KPI row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub active_members: u64,
    pub total_sessions: u64,
    pub total_events: u64,
    pub total_engagement_seconds: u64,
    pub total_engagement_hours: Tenths,
    pub avg_engagement_minutes_per_member: Tenths,
    pub avg_sessions_per_member: Tenths,
    pub total_resource_views: u64,
    pub premium_members: u64,
    pub registered_members: u64,
    pub free_members: u64,
    pub top_topic: Option<String>,
    pub top_content_type: Option<String>,
    pub members_by_tier: BTreeMap<MemberTier, u64>,
    pub members_by_region: BTreeMap<String, u64>,
    pub report_generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_are_bucketed() {
        assert_eq!(ContentCategory::classify("webinar"), ContentCategory::Multimedia);
        assert_eq!(ContentCategory::classify(" Video "), ContentCategory::Multimedia);
        assert_eq!(ContentCategory::classify("worksheet"), ContentCategory::Reading);
        assert_eq!(ContentCategory::classify("quiz"), ContentCategory::Interactive);
        assert_eq!(ContentCategory::classify(""), ContentCategory::Interactive);
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!("VIEW".parse::<EventType>(), Ok(EventType::View));
        assert_eq!(" bookmark".parse::<EventType>(), Ok(EventType::Bookmark));
        assert!("click".parse::<EventType>().is_err());
        assert_eq!("Premium".parse::<MemberTier>(), Ok(MemberTier::Premium));
    }

    #[test]
    fn tier_keys_serialize_as_names() {
        let mut by_tier = BTreeMap::new();
        by_tier.insert(MemberTier::Premium, 2u64);
        by_tier.insert(MemberTier::Free, 1u64);
        assert_eq!(
            serde_json::to_string(&by_tier).unwrap(),
            r#"{"free":1,"premium":2}"#
        );
    }
}
