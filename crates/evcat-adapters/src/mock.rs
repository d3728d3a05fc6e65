use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use evcat_core::{EventLocation, RawEventRecord, SourceError, SourceProvenance};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};

use crate::{FetchQuery, SourceAdapter};

struct Template {
    title: &'static str,
    description: &'static str,
    category: &'static str,
    tags: &'static [&'static str],
}

const TEMPLATES: &[Template] = &[
    Template {
        title: "Tech Meetup",
        description: "Join us for an evening of networking and tech discussions",
        category: "Technology",
        tags: &["networking", "technology", "startup"],
    },
    Template {
        title: "Art Gallery Opening",
        description: "Opening reception for the new contemporary art exhibition",
        category: "Arts & Culture",
        tags: &["art", "culture", "exhibition"],
    },
    Template {
        title: "Music Concert",
        description: "Live music performance featuring local artists",
        category: "Music",
        tags: &["music", "concert", "live"],
    },
    Template {
        title: "Food Festival",
        description: "Taste the best local cuisine and craft beverages",
        category: "Food & Drink",
        tags: &["food", "festival", "local"],
    },
    Template {
        title: "Fitness Workshop",
        description: "Learn new fitness techniques and healthy living tips",
        category: "Health & Wellness",
        tags: &["fitness", "health", "workshop"],
    },
    Template {
        title: "Business Conference",
        description: "Annual business conference with industry leaders",
        category: "Business",
        tags: &["business", "conference", "networking"],
    },
    Template {
        title: "Community Cleanup",
        description: "Help keep our community clean and beautiful",
        category: "Community",
        tags: &["volunteer", "community", "environment"],
    },
    Template {
        title: "Book Reading",
        description: "Author reading and book signing event",
        category: "Education",
        tags: &["books", "education", "literature"],
    },
];

const VENUES: &[&str] = &[
    "Community Center",
    "Downtown Convention Center",
    "City Hall",
    "Local Library",
    "Park Pavilion",
    "University Campus",
    "Art Gallery",
    "Concert Hall",
];

const STREETS: &[&str] = &["Main St", "First Ave", "Oak St", "Pine St", "Elm St"];

/// Synthetic listings for demos and offline runs. Output depends only on the
/// city, the anchor date and the platform name.
#[derive(Debug, Clone)]
pub struct MockAdapter {
    platform: String,
    events_per_city: usize,
    anchor: Option<NaiveDate>,
}

impl MockAdapter {
    pub fn new(platform: impl Into<String>, events_per_city: usize, anchor: Option<NaiveDate>) -> Self {
        Self {
            platform: platform.into(),
            events_per_city,
            anchor,
        }
    }

    fn generate(&self, query: &FetchQuery, anchor: NaiveDate) -> Vec<RawEventRecord> {
        let slug = query.city_slug();
        let mut rng = StdRng::seed_from_u64(seed(&[&self.platform, &slug, &anchor.to_string()]));
        let base = Utc.from_utc_datetime(&anchor.and_hms_opt(0, 0, 0).unwrap_or_default());
        let scraped_at = base;

        let count = self.events_per_city.min(query.limit);
        let mut records = Vec::with_capacity(count);
        for index in 0..count {
            let Some(template) = TEMPLATES.choose(&mut rng) else {
                break;
            };
            let days_ahead = rng.random_range(1..=30);
            let hour = rng.random_range(9..=20);
            let minute = *[0, 15, 30, 45].choose(&mut rng).unwrap_or(&0);
            let start = base
                + Duration::days(days_ahead)
                + Duration::hours(hour)
                + Duration::minutes(minute);
            let venue = VENUES.choose(&mut rng).copied().unwrap_or("Community Center");
            let street_number = [100, 200, 300, 400, 500]
                .choose(&mut rng)
                .copied()
                .unwrap_or(100)
                + index * 10;
            let street = STREETS.choose(&mut rng).copied().unwrap_or("Main St");

            let mut location = EventLocation::new(query.city.clone(), query.country.clone());
            location.state = query.state.clone();
            location.venue = Some(venue.to_string());
            location.address = Some(format!("{street_number} {street}, {}, {}", query.city, query.country));
            location.lat = Some(round6(rng.random_range(40.0..50.0)));
            location.lon = Some(round6(rng.random_range(-80.0..-70.0)));

            records.push(RawEventRecord {
                title: format!("{} - {}", template.title, query.city),
                description: template.description.to_string(),
                start_time: start,
                end_time: Some(start + Duration::hours(rng.random_range(1..=4))),
                location,
                price: None,
                category: Some(template.category.to_string()),
                tags: template.tags.iter().map(|t| t.to_string()).collect(),
                provenance: SourceProvenance {
                    platform: self.platform.clone(),
                    url: format!("https://mock-events.com/events/{slug}-{index}"),
                    scraped_at,
                    source_id: Some(format!("mock-{slug}-{index}")),
                },
            });
        }
        records
    }
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// FNV-1a over the parts, so seeds are stable across builds.
fn seed(parts: &[&str]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in part.bytes().chain(std::iter::once(0xff)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_events(&self, query: &FetchQuery) -> Result<Vec<RawEventRecord>, SourceError> {
        let anchor = self.anchor.unwrap_or_else(|| Utc::now().date_naive());
        Ok(self.generate(query, anchor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 1).unwrap()
    }

    #[tokio::test]
    async fn same_inputs_generate_identical_listings() {
        let adapter = MockAdapter::new("mock_events", 5, Some(anchor()));
        let query = FetchQuery::new("Austin", "US", 50);
        let a = adapter.fetch_events(&query).await.unwrap();
        let b = adapter.fetch_events(&query).await.unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(a, b);

        let other_city = adapter
            .fetch_events(&FetchQuery::new("Denver", "US", 50))
            .await
            .unwrap();
        assert_ne!(a[0].provenance.url, other_city[0].provenance.url);
    }

    #[tokio::test]
    async fn listings_are_plausible_and_uniquely_addressed() {
        let adapter = MockAdapter::new("mock_events", 8, Some(anchor()));
        let records = adapter
            .fetch_events(&FetchQuery::new("New York", "US", 3))
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert!(record.title.ends_with(" - New York"));
            assert_eq!(
                record.provenance.url,
                format!("https://mock-events.com/events/new-york-{i}")
            );
            assert!(record.start_time > Utc.from_utc_datetime(&anchor().and_hms_opt(0, 0, 0).unwrap()));
            assert!(record.end_time.unwrap() > record.start_time);
            assert!(record.location.coordinates().is_some());
        }
    }
}
