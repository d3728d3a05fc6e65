//! Source adapter contract, the source-kind registry, and the bundled adapters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use evcat_core::{RawEventRecord, SourceError};
use evcat_storage::HttpClient;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod fixture;
mod json_ld;
mod mock;

pub use fixture::{FixtureAdapter, FixtureListing};
pub use json_ld::{parse_json_ld_events, JsonLdAdapter};
pub use mock::MockAdapter;

pub const CRATE_NAME: &str = "evcat-adapters";

/// What to fetch from a source for one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchQuery {
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub country: String,
    pub limit: usize,
}

impl FetchQuery {
    pub fn new(city: impl Into<String>, country: impl Into<String>, limit: usize) -> Self {
        Self {
            city: city.into(),
            state: None,
            country: country.into(),
            limit,
        }
    }

    /// URL-safe form of the city, e.g. "New York" -> "new-york".
    pub fn city_slug(&self) -> String {
        evcat_core::text::tokens(&self.city).join("-")
    }
}

/// One external source. Every failure comes back as a classified [`SourceError`].
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> &str;

    async fn fetch_events(&self, query: &FetchQuery) -> Result<Vec<RawEventRecord>, SourceError>;
}

fn default_events_per_city() -> usize {
    6
}

/// Adapter constructor selected by the `kind` tag of a source definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    /// JSON listing file on disk.
    Fixture { path: PathBuf },
    /// Deterministic synthetic listings.
    Mock {
        #[serde(default = "default_events_per_city")]
        events_per_city: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor: Option<NaiveDate>,
    },
    /// Pages carrying schema.org `Event` objects in `application/ld+json` blocks.
    /// `{city}` in a URL is replaced with the city slug.
    JsonLd { urls: Vec<String> },
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Fixture { .. } => "fixture",
            SourceKind::Mock { .. } => "mock",
            SourceKind::JsonLd { .. } => "json_ld",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source {source_name}: {message}")]
    InvalidDefinition { source_name: String, message: String },
}

/// Shared resources handed to adapter constructors.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub http: HttpClient,
    /// Relative fixture paths resolve against this directory.
    pub base_dir: PathBuf,
}

impl AdapterContext {
    pub fn new(http: HttpClient, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            http,
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// Build the adapter for a configured source. Resolved once when the configuration loads.
pub fn build_adapter(
    name: &str,
    kind: &SourceKind,
    ctx: &AdapterContext,
) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    let invalid = |message: &str| AdapterError::InvalidDefinition {
        source_name: name.to_string(),
        message: message.to_string(),
    };
    if name.trim().is_empty() {
        return Err(invalid("source name is empty"));
    }

    match kind {
        SourceKind::Fixture { path } => {
            if path.as_os_str().is_empty() {
                return Err(invalid("fixture path is empty"));
            }
            Ok(Arc::new(FixtureAdapter::new(name, ctx.resolve(path))))
        }
        SourceKind::Mock {
            events_per_city,
            anchor,
        } => Ok(Arc::new(MockAdapter::new(name, *events_per_city, *anchor))),
        SourceKind::JsonLd { urls } => {
            if urls.is_empty() {
                return Err(invalid("json_ld source needs at least one url"));
            }
            if let Some(bad) = urls
                .iter()
                .find(|u| !(u.starts_with("http://") || u.starts_with("https://")))
            {
                return Err(invalid(&format!("unsupported url {bad}")));
            }
            Ok(Arc::new(JsonLdAdapter::new(name, urls.clone(), ctx.http.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evcat_storage::HttpClientConfig;

    fn ctx() -> AdapterContext {
        AdapterContext::new(
            HttpClient::new(HttpClientConfig::default()).expect("http client"),
            "/srv/evcat",
        )
    }

    #[test]
    fn source_kind_is_tagged_in_yaml() {
        let kinds: Vec<SourceKind> = serde_yaml::from_str(
            r#"
- type: fixture
  path: fixtures/meetup.json
- type: mock
- type: json_ld
  urls: ["https://example.test/{city}/events"]
"#,
        )
        .unwrap();
        assert_eq!(
            kinds[1],
            SourceKind::Mock {
                events_per_city: 6,
                anchor: None
            }
        );
        assert_eq!(
            kinds.iter().map(SourceKind::label).collect::<Vec<_>>(),
            vec!["fixture", "mock", "json_ld"]
        );
    }

    #[test]
    fn registry_builds_each_kind_under_the_configured_name() {
        let ctx = ctx();
        let fixture = build_adapter(
            "meetup",
            &SourceKind::Fixture {
                path: "fixtures/meetup.json".into(),
            },
            &ctx,
        )
        .unwrap();
        assert_eq!(fixture.platform(), "meetup");

        let mock = build_adapter(
            "mock_events",
            &SourceKind::Mock {
                events_per_city: 3,
                anchor: None,
            },
            &ctx,
        )
        .unwrap();
        assert_eq!(mock.platform(), "mock_events");
    }

    #[test]
    fn registry_rejects_malformed_definitions() {
        let ctx = ctx();
        assert!(build_adapter("ld", &SourceKind::JsonLd { urls: vec![] }, &ctx).is_err());
        assert!(build_adapter(
            "ld",
            &SourceKind::JsonLd {
                urls: vec!["ftp://example.test".into()]
            },
            &ctx
        )
        .is_err());
        assert!(build_adapter(" ", &SourceKind::Mock { events_per_city: 1, anchor: None }, &ctx).is_err());
    }

    #[test]
    fn city_slug_is_url_safe() {
        assert_eq!(FetchQuery::new("New York", "US", 10).city_slug(), "new-york");
        assert_eq!(FetchQuery::new(" São Paulo ", "BR", 10).city_slug(), "são-paulo");
    }
}
