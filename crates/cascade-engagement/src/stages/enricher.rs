//! Catalog enricher: stateless per-resource transform.

use super::RESOURCES;
use crate::model::{ContentCategory, Resource, ResourceCatalogEntry};
use cascade_kernel::{Materialized, RefreshContext, StageError, StageOperator};
use chrono::NaiveDate;

/// Enrich one resource as of `today`
#[must_use]
pub fn enrich(resource: &Resource, today: NaiveDate) -> ResourceCatalogEntry {
    ResourceCatalogEntry {
        resource_id: resource.resource_id,
        title: resource.title.clone(),
        content_type: resource.content_type.clone(),
        topic: resource.topic.clone(),
        difficulty: resource.difficulty.clone(),
        publish_date: resource.publish_date,
        content_category: ContentCategory::classify(&resource.content_type),
        days_since_publish: (today - resource.publish_date).num_days(),
    }
}

/// Catalog enricher stage operator
///
/// Its output depends on the refresh date, so it is registered as
/// time-dependent and recomputed on every tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogEnricher;

impl StageOperator for CatalogEnricher {
    fn recompute(&self, ctx: &RefreshContext) -> Result<Materialized, StageError> {
        let today = ctx.now().date_naive();
        let resources = ctx.rows::<Resource>(RESOURCES)?;
        let catalog: Vec<ResourceCatalogEntry> =
            resources.iter().map(|r| enrich(r, today)).collect();
        Materialized::from_rows(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(content_type: &str) -> Resource {
        Resource {
            resource_id: 1,
            title: "Understanding ADHD".into(),
            content_type: content_type.into(),
            topic: "focus".into(),
            difficulty: "beginner".into(),
            publish_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        }
    }

    #[test]
    fn categories_and_age_are_derived() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();

        let webinar = enrich(&resource("webinar"), today);
        assert_eq!(webinar.content_category, ContentCategory::Multimedia);
        assert_eq!(webinar.days_since_publish, 30);

        let quiz = enrich(&resource("quiz"), today);
        assert_eq!(quiz.content_category, ContentCategory::Interactive);
    }

    #[test]
    fn future_publish_dates_give_negative_age() {
        let today = NaiveDate::from_ymd_opt(2023, 12, 30).unwrap();
        assert_eq!(enrich(&resource("article"), today).days_since_publish, -2);
    }
}
