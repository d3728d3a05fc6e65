use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evcat_core::{EventLocation, RawEventRecord, SourceError, SourceProvenance};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{FetchQuery, SourceAdapter};

/// One listing in a fixture file. Provenance is stamped by the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureListing {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub location: EventLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FixtureListing {
    fn into_record(self, platform: &str, scraped_at: DateTime<Utc>) -> RawEventRecord {
        RawEventRecord {
            title: self.title,
            description: self.description,
            start_time: self.start_time,
            end_time: self.end_time,
            location: self.location,
            price: self.price,
            category: self.category,
            tags: self.tags,
            provenance: SourceProvenance {
                platform: platform.to_string(),
                url: self.url,
                scraped_at,
                source_id: self.source_id,
            },
        }
    }
}

/// Serves listings from a JSON array on disk. The file is re-read on every fetch.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    platform: String,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(platform: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            platform: platform.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_events(&self, query: &FetchQuery) -> Result<Vec<RawEventRecord>, SourceError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            SourceError::parse(format!("reading fixture {}: {err}", self.path.display()))
        })?;
        let listings: Vec<FixtureListing> = serde_json::from_str(&text).map_err(|err| {
            SourceError::parse(format!("parsing fixture {}: {err}", self.path.display()))
        })?;

        let city = evcat_core::text::normalize_city(&query.city);
        let scraped_at = Utc::now();
        let records = listings
            .into_iter()
            .filter(|l| l.location.city_key() == city)
            .take(query.limit)
            .map(|l| l.into_record(&self.platform, scraped_at))
            .collect::<Vec<_>>();
        debug!(platform = %self.platform, city = %query.city, records = records.len(), "fixture listings loaded");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evcat_core::SourceErrorKind;
    use std::io::Write;

    const LISTINGS: &str = r#"[
      {"url": "https://meetup.test/e/1", "title": "Tech Meetup NYC",
       "start_time": "2025-10-20T18:00:00Z", "location": {"city": "New York", "country": "US"}},
      {"url": "https://meetup.test/e/2", "title": "Rust Night",
       "start_time": "2025-10-21T18:00:00Z", "location": {"city": "new york", "country": "US"}},
      {"url": "https://meetup.test/e/3", "title": "Austin Tacos",
       "start_time": "2025-10-21T18:00:00Z", "location": {"city": "Austin", "country": "US"}}
    ]"#;

    fn write_fixture(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(body.as_bytes()).expect("write fixture");
        file
    }

    #[tokio::test]
    async fn filters_by_city_and_applies_limit() {
        let file = write_fixture(LISTINGS);
        let adapter = FixtureAdapter::new("meetup", file.path());

        let all = adapter
            .fetch_events(&FetchQuery::new("New York", "US", 10))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.provenance.platform == "meetup"));

        let limited = adapter
            .fetch_events(&FetchQuery::new("New York", "US", 1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].provenance.url, "https://meetup.test/e/1");
    }

    #[tokio::test]
    async fn missing_or_malformed_fixture_is_a_parse_error() {
        let adapter = FixtureAdapter::new("meetup", "/nonexistent/evcat/fixture.json");
        let err = adapter
            .fetch_events(&FetchQuery::new("Austin", "US", 5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Parse);

        let file = write_fixture("{ not json");
        let err = FixtureAdapter::new("meetup", file.path())
            .fetch_events(&FetchQuery::new("Austin", "US", 5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Parse);
    }
}
