use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use evcat_adapters::{FetchQuery, SourceAdapter};
use evcat_core::{EventLocation, RawEventRecord, SourceError, SourceErrorKind, SourceProvenance};
use evcat_storage::{FailureClass, MemoryGateway, RetryPolicy, TokenBucketConfig};
use evcat_sync::{
    CatalogConfig, CollectionCycle, FailureReason, LocationConfig, OrchestratorConfig,
    SourceHandle, SourceStatus,
};

/// Two listings, each on its own day so no pair shares a fingerprint bucket.
struct Healthy {
    platform: String,
    first_day: u32,
}

#[async_trait]
impl SourceAdapter for Healthy {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_events(&self, query: &FetchQuery) -> Result<Vec<RawEventRecord>, SourceError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok((0..2)
            .map(|i| {
                let start = Utc.with_ymd_and_hms(2025, 11, self.first_day + i * 2, 19, 0, 0).unwrap();
                RawEventRecord {
                    title: format!("{} showcase", self.platform),
                    description: String::new(),
                    start_time: start,
                    end_time: None,
                    location: EventLocation::new(query.city.clone(), query.country.clone()),
                    price: None,
                    category: None,
                    tags: Vec::new(),
                    provenance: SourceProvenance {
                        platform: self.platform.clone(),
                        url: format!("https://{}.test/{i}", self.platform),
                        scraped_at: start,
                        source_id: None,
                    },
                }
            })
            .collect())
    }
}

/// Never answers within the call deadline.
struct Hanging {
    calls: AtomicU32,
}

#[async_trait]
impl SourceAdapter for Hanging {
    fn platform(&self) -> &str {
        "hanging"
    }

    async fn fetch_events(&self, _query: &FetchQuery) -> Result<Vec<RawEventRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

fn config() -> CatalogConfig {
    CatalogConfig {
        orchestrator: OrchestratorConfig {
            workers: 3,
            call_timeout_ms: 2_000,
            cycle_timeout_ms: 120_000,
            rate_limit_wait_ms: 5_000,
            per_source_limit: 50,
        },
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter: 0.1,
        },
        ..CatalogConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn one_hanging_source_of_five_is_isolated() {
    let hanging = Arc::new(Hanging {
        calls: AtomicU32::new(0),
    });
    let mut sources = ["alpha", "bravo", "charlie", "delta"]
        .into_iter()
        .zip([1, 5, 9, 13])
        .map(|(name, first_day)| {
            SourceHandle::new(
                name,
                Arc::new(Healthy {
                    platform: name.to_string(),
                    first_day,
                }),
                TokenBucketConfig::default(),
            )
        })
        .collect::<Vec<_>>();
    sources.insert(2, SourceHandle::new("hanging", hanging.clone(), TokenBucketConfig::default()));

    let gateway = Arc::new(MemoryGateway::new());
    let cycle = CollectionCycle::new(&config(), sources.clone(), gateway.clone());
    let report = cycle
        .run(&[LocationConfig::new("Seattle", "US")], &sources)
        .await
        .unwrap();

    assert_eq!(report.records_fetched, 8);
    assert_eq!(report.canonical_created, 8);
    assert_eq!(gateway.len(), 8);

    assert_eq!(report.source_failures.len(), 1);
    let failure = &report.source_failures[0];
    assert_eq!(failure.source, "hanging");
    assert_eq!(failure.reason, FailureReason::RetriesExhausted);
    assert_eq!(failure.class, Some(FailureClass::Transient));
    assert_eq!(failure.attempts, 3);
    assert_eq!(
        failure.last_error.as_ref().map(|e| e.kind),
        Some(SourceErrorKind::Timeout)
    );
    assert_eq!(hanging.calls.load(Ordering::SeqCst), 3);

    assert_eq!(report.source_outcomes.len(), 5);
    let succeeded = report
        .source_outcomes
        .iter()
        .filter(|o| matches!(o.status, SourceStatus::Succeeded { records: 2 }))
        .count();
    assert_eq!(succeeded, 4);
    assert_eq!(report.retried_sources().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cycle_deadline_reports_the_unfinished_source() {
    let mut config = config();
    config.orchestrator.cycle_timeout_ms = 3_000;
    config.orchestrator.call_timeout_ms = 60_000;

    let sources = vec![
        SourceHandle::new(
            "alpha",
            Arc::new(Healthy {
                platform: "alpha".into(),
                first_day: 1,
            }),
            TokenBucketConfig::default(),
        ),
        SourceHandle::new(
            "hanging",
            Arc::new(Hanging {
                calls: AtomicU32::new(0),
            }),
            TokenBucketConfig::default(),
        ),
    ];
    let cycle = CollectionCycle::new(&config, sources.clone(), Arc::new(MemoryGateway::new()));
    let report = cycle
        .run(&[LocationConfig::new("Seattle", "US")], &sources)
        .await
        .unwrap();

    assert_eq!(report.records_fetched, 2);
    assert_eq!(report.source_failures.len(), 1);
    assert_eq!(report.source_failures[0].source, "hanging");
    assert_eq!(report.source_failures[0].reason, FailureReason::DeadlineExceeded);
}
