//! Testing utilities for the Cascade workspace
//!
//! Shared fixtures: a fixed clock, a pipeline wired to it, and small builders
//! for members, resources and event records.

#![allow(missing_docs)]

use cascade_engagement::{
    EngagementPipeline, EventType, Member, MemberId, MemberTier, PipelineConfig, RawEventRecord,
    Resource, ResourceId,
};
use cascade_kernel::FixedClock;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use std::sync::Arc;

/// Instant every fixture clock starts at
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

/// `minutes` after [`epoch`]
pub fn at_minute(minutes: i64) -> DateTime<Utc> {
    epoch() + Duration::minutes(minutes)
}

pub fn fixed_clock() -> FixedClock {
    FixedClock::new(epoch())
}

/// Pipeline on a fixed clock, with the clock handle for advancing time
pub fn pipeline_with(config: PipelineConfig) -> (EngagementPipeline, FixedClock) {
    let clock = fixed_clock();
    let pipeline = EngagementPipeline::new(config, Arc::new(clock.clone())).unwrap();
    (pipeline, clock)
}

pub fn test_pipeline() -> (EngagementPipeline, FixedClock) {
    pipeline_with(PipelineConfig::default())
}

pub fn member(member_id: MemberId, tier: MemberTier, region: &str) -> Member {
    Member {
        member_id,
        member_name: format!("Member {member_id}"),
        member_type: tier,
        region: region.to_string(),
    }
}

pub fn resource(resource_id: ResourceId, content_type: &str, topic: &str) -> Resource {
    Resource {
        resource_id,
        title: format!("{content_type} about {topic}"),
        content_type: content_type.to_string(),
        topic: topic.to_string(),
        difficulty: "beginner".to_string(),
        publish_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
    }
}

/// Members 42, 7 and 8 across tiers and regions
pub fn standard_members() -> Vec<Member> {
    vec![
        member(42, MemberTier::Premium, "Northeast"),
        member(7, MemberTier::Free, "West"),
        member(8, MemberTier::Registered, "West"),
    ]
}

/// Resources 1..=4; resource 7 is the focus webinar of the S1 scenario
pub fn standard_resources() -> Vec<Resource> {
    vec![
        resource(1, "article", "reading"),
        resource(2, "video", "focus"),
        resource(3, "quiz", "math"),
        resource(4, "podcast", "focus"),
        resource(7, "webinar", "focus"),
    ]
}

/// A view event with resource and engagement
pub fn view(
    member_id: MemberId,
    session: &str,
    minute: i64,
    resource: ResourceId,
    seconds: i64,
) -> RawEventRecord {
    RawEventRecord::new(member_id, session, EventType::View, at_minute(minute))
        .with_resource(resource)
        .with_engagement(seconds)
}

/// A start event without a resource
pub fn start(member_id: MemberId, session: &str, minute: i64) -> RawEventRecord {
    RawEventRecord::new(member_id, session, EventType::Start, at_minute(minute))
}

/// Pipeline loaded with the standard members and resources and bootstrapped
pub async fn loaded_pipeline(config: PipelineConfig) -> (EngagementPipeline, FixedClock) {
    let (pipeline, clock) = pipeline_with(config);
    pipeline.load_members(standard_members()).await.unwrap();
    pipeline.load_resources(standard_resources()).await.unwrap();
    pipeline.bootstrap().await.unwrap();
    (pipeline, clock)
}
