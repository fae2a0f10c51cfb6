//! Deterministic synthetic data for demos, benchmarks and tests.
//!
//! Everything is drawn from a seeded `StdRng`, so a given
//! [`GeneratorConfig`] always produces the same members, resources and
//! event batches.

use crate::ingest::RawEventRecord;
use crate::model::{EventType, Member, MemberTier, Resource, ResourceId};
use crate::producer::EventProducer;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

const FIRST_NAMES: &[&str] = &[
    "Avery", "Jordan", "Riley", "Morgan", "Casey", "Quinn", "Harper", "Rowan", "Emerson", "Sage",
];
const LAST_NAMES: &[&str] = &[
    "Nguyen", "Patel", "Garcia", "Okafor", "Schmidt", "Kim", "Rossi", "Haddad", "Silva", "Walsh",
];
const REGIONS: &[&str] = &["Midwest", "Northeast", "Southeast", "Southwest", "West"];
const TOPICS: &[&str] = &[
    "focus",
    "reading",
    "anxiety",
    "organization",
    "social skills",
    "math",
];
const CONTENT_TYPES: &[&str] = &[
    "video", "webinar", "podcast", "article", "guide", "worksheet", "quiz", "tool",
];
const DIFFICULTIES: &[&str] = &["beginner", "intermediate", "advanced"];
const DEVICES: &[&str] = &["desktop", "mobile", "tablet"];

/// Shape of the generated data
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    /// Random seed
    pub seed: u64,
    /// Number of members
    pub members: usize,
    /// Number of catalog resources
    pub resources: usize,
    /// Sessions per event batch
    pub sessions_per_batch: usize,
    /// Upper bound of events in one session
    pub max_events_per_session: usize,
    /// Share of records deliberately made invalid
    pub malformed_ratio: f64,
    /// Timestamp of the first session
    pub start: DateTime<Utc>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            members: 50,
            resources: 20,
            sessions_per_batch: 25,
            max_events_per_session: 6,
            malformed_ratio: 0.02,
            start: Utc
                .with_ymd_and_hms(2024, 3, 1, 8, 0, 0)
                .single()
                .unwrap_or_default(),
        }
    }
}

/// Seeded generator of members, resources and raw event batches
#[derive(Debug, Clone)]
pub struct SyntheticData {
    rng: StdRng,
    config: GeneratorConfig,
    members: Vec<Member>,
    resources: Vec<Resource>,
    cursor: DateTime<Utc>,
    next_session: u64,
}

impl SyntheticData {
    /// Draw the reference data for `config`
    #[must_use]
    pub fn new(config: GeneratorConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let members = (1..=config.members as u64)
            .map(|id| random_member(&mut rng, id))
            .collect();
        let resources = (1..=config.resources as u64)
            .map(|id| random_resource(&mut rng, id, config.start))
            .collect();
        Self {
            rng,
            cursor: config.start,
            members,
            resources,
            next_session: 1,
            config,
        }
    }

    /// Generated members
    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Generated resources
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Timestamp after the newest generated event
    #[must_use]
    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursor
    }

    /// Generate the next batch of event records
    pub fn next_batch(&mut self) -> Vec<RawEventRecord> {
        let mut batch = Vec::new();
        for _ in 0..self.config.sessions_per_batch {
            self.session(&mut batch);
        }
        batch
    }

    /// Producer yielding `batches` batches
    #[must_use]
    pub fn into_feed(self, batches: usize) -> SyntheticFeed {
        SyntheticFeed {
            data: self,
            remaining: batches,
        }
    }

    fn session(&mut self, out: &mut Vec<RawEventRecord>) {
        if self.members.is_empty() {
            return;
        }
        let session_id = format!("S{:06}", self.next_session);
        self.next_session += 1;
        let member_id = self.rng.gen_range(1..=self.members.len() as u64);
        let device = pick(&mut self.rng, DEVICES);
        let events = self.rng.gen_range(1..=self.config.max_events_per_session.max(1));

        self.cursor += Duration::minutes(self.rng.gen_range(1..=30));
        let mut at = self.cursor;
        for _ in 0..events {
            let event_type = *EventType::ALL.choose(&mut self.rng).unwrap_or(&EventType::View);
            let mut record = RawEventRecord::new(member_id, session_id.clone(), event_type, at);
            if let Some(resource) = self.resource_id() {
                record = record.with_resource(resource);
            }
            if self.rng.gen_bool(0.9) {
                record = record.with_engagement(self.rng.gen_range(5..=900));
            }
            if self.rng.gen_bool(0.8) {
                record = record.with_device(device);
            }
            if self.rng.gen_bool(self.config.malformed_ratio.clamp(0.0, 1.0)) {
                self.corrupt(&mut record);
            }
            out.push(record);
            at += Duration::seconds(self.rng.gen_range(10..=600));
        }
        self.cursor = self.cursor.max(at);
    }

    /// A catalog resource, occasionally none or an id missing from the catalog
    fn resource_id(&mut self) -> Option<ResourceId> {
        if self.resources.is_empty() || self.rng.gen_bool(0.1) {
            return None;
        }
        let known = self.resources.len() as u64;
        if self.rng.gen_bool(0.03) {
            return Some(known + 1);
        }
        Some(self.rng.gen_range(1..=known))
    }

    fn corrupt(&mut self, record: &mut RawEventRecord) {
        match self.rng.gen_range(0..4) {
            0 => record.timestamp = Some("not-a-timestamp".into()),
            1 => record.member_id = None,
            2 => record.event_type = Some("hover".into()),
            _ => record.engagement_seconds = Some(-30),
        }
    }
}

fn pick<'a>(rng: &mut StdRng, values: &[&'a str]) -> &'a str {
    values.choose(rng).copied().unwrap_or_default()
}

fn random_member(rng: &mut StdRng, member_id: u64) -> Member {
    let roll: f64 = rng.gen();
    let member_type = if roll < 0.5 {
        MemberTier::Free
    } else if roll < 0.85 {
        MemberTier::Registered
    } else {
        MemberTier::Premium
    };
    Member {
        member_id,
        member_name: format!("{} {}", pick(rng, FIRST_NAMES), pick(rng, LAST_NAMES)),
        member_type,
        region: pick(rng, REGIONS).to_string(),
    }
}

fn random_resource(rng: &mut StdRng, resource_id: u64, start: DateTime<Utc>) -> Resource {
    let topic = pick(rng, TOPICS);
    let content_type = pick(rng, CONTENT_TYPES);
    let age = Duration::days(rng.gen_range(0..720));
    Resource {
        resource_id,
        title: format!("{content_type} on {topic} #{resource_id}"),
        content_type: content_type.to_string(),
        topic: topic.to_string(),
        difficulty: pick(rng, DIFFICULTIES).to_string(),
        publish_date: (start - age).date_naive(),
    }
}

/// Synthetic producer with a fixed number of batches
#[derive(Debug, Clone)]
pub struct SyntheticFeed {
    data: SyntheticData,
    remaining: usize,
}

impl SyntheticFeed {
    /// Underlying generator
    #[must_use]
    pub fn data(&self) -> &SyntheticData {
        &self.data
    }
}

#[async_trait::async_trait]
impl EventProducer for SyntheticFeed {
    async fn next_batch(&mut self) -> Option<Vec<RawEventRecord>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.data.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_data() {
        let mut a = SyntheticData::new(GeneratorConfig::default());
        let mut b = SyntheticData::new(GeneratorConfig::default());
        assert_eq!(a.members(), b.members());
        assert_eq!(a.resources(), b.resources());
        assert_eq!(a.next_batch(), b.next_batch());
    }

    #[test]
    fn different_seeds_diverge() {
        let a = SyntheticData::new(GeneratorConfig::default());
        let b = SyntheticData::new(GeneratorConfig {
            seed: 7,
            ..GeneratorConfig::default()
        });
        assert_ne!(a.members(), b.members());
    }

    #[test]
    fn batches_reference_generated_members() {
        let config = GeneratorConfig {
            members: 5,
            malformed_ratio: 0.0,
            ..GeneratorConfig::default()
        };
        let mut data = SyntheticData::new(config);
        let batch = data.next_batch();
        assert!(!batch.is_empty());
        for record in &batch {
            let event = record.validate(0).unwrap();
            assert!((1..=5).contains(&event.member_id));
        }
    }

    #[tokio::test]
    async fn feed_stops_after_its_batches() {
        let mut feed = SyntheticData::new(GeneratorConfig::default()).into_feed(2);
        assert!(feed.next_batch().await.is_some());
        assert!(feed.next_batch().await.is_some());
        assert!(feed.next_batch().await.is_none());
    }
}
