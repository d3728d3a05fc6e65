//! One collection cycle: collect every location, resolve records into canonical
//! events, persist what changed, then enrich.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use evcat_adapters::AdapterContext;
use evcat_core::{CanonicalEvent, ProvenanceKey, ReviewFlag};
use evcat_storage::{deadline_after, CandidateWindow, PersistenceError, PersistenceGateway};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{CatalogConfig, ConfigError, LocationConfig, MergeConfig, ScoringConfig};
use crate::enrichment::{apply_enrichment, EnrichmentHook, NoopEnrichmentHook};
use crate::merge::{MergeOutcome, MergeResolver};
use crate::orchestrator::{
    CollectionResult, Orchestrator, SourceHandle, SourceOutcome, SourcePartialFailure,
};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("looking up stored candidates: {0}")]
    CandidateLookup(#[source] PersistenceError),
    #[error("persistence unavailable: all {failed} upserts failed, last error: {last_error}")]
    PersistenceUnavailable { failed: usize, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceFailure {
    pub canonical_id: Uuid,
    pub error: String,
}

/// What a cycle did, source by source and record by record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub locations: Vec<String>,
    pub records_fetched: usize,
    pub canonical_created: usize,
    pub auto_merged: usize,
    pub pending_review: usize,
    /// Records whose `(platform, url)` was already merged.
    pub unchanged: usize,
    pub source_failures: Vec<SourcePartialFailure>,
    pub source_outcomes: Vec<SourceOutcome>,
    /// Configured but disabled.
    pub skipped_sources: Vec<String>,
    pub persisted: usize,
    pub persistence_failures: Vec<PersistenceFailure>,
    pub review_flags: usize,
    pub enriched: usize,
    pub enrichment_failures: usize,
}

impl CollectionReport {
    pub fn retried_sources(&self) -> impl Iterator<Item = &SourceOutcome> {
        self.source_outcomes.iter().filter(|o| o.attempts > 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDecision {
    pub provenance: ProvenanceKey,
    #[serde(flatten)]
    pub outcome: MergeOutcome,
}

/// A report plus the data behind it, for snapshots and tests.
#[derive(Debug, Clone)]
pub struct CycleRun {
    pub report: CollectionReport,
    /// Events created or changed by this cycle, ordered by id, as last persisted.
    pub events: Vec<CanonicalEvent>,
    pub reviews: Vec<ReviewFlag>,
    pub decisions: Vec<RecordDecision>,
}

pub struct CollectionCycle {
    orchestrator: Orchestrator,
    scoring: ScoringConfig,
    merge: MergeConfig,
    per_source_limit: usize,
    sources: Vec<SourceHandle>,
    skipped: Vec<String>,
    gateway: Arc<dyn PersistenceGateway>,
    enrichment: Arc<dyn EnrichmentHook>,
}

impl CollectionCycle {
    pub fn new(
        config: &CatalogConfig,
        sources: Vec<SourceHandle>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(&config.orchestrator, config.retry),
            scoring: config.scoring,
            merge: config.merge,
            per_source_limit: config.orchestrator.per_source_limit,
            sources,
            skipped: Vec::new(),
            gateway,
            enrichment: Arc::new(NoopEnrichmentHook),
        }
    }

    /// Build adapters for every enabled source. Disabled ones are reported as skipped.
    pub fn from_config(
        config: &CatalogConfig,
        ctx: &AdapterContext,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Result<Self, CycleError> {
        config.validate()?;
        let sources = config
            .enabled_sources()
            .map(|source| SourceHandle::from_config(source, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ConfigError::from)?;
        let mut cycle = Self::new(config, sources, gateway);
        cycle.skipped = config
            .sources
            .iter()
            .filter(|s| !s.enabled)
            .map(|s| s.name.clone())
            .collect();
        Ok(cycle)
    }

    pub fn with_enrichment(mut self, hook: Arc<dyn EnrichmentHook>) -> Self {
        self.enrichment = hook;
        self
    }

    pub fn sources(&self) -> &[SourceHandle] {
        &self.sources
    }

    /// The named sources, in configured order. An empty list selects all of them.
    pub fn select_sources(&self, names: &[String]) -> Result<Vec<SourceHandle>, CycleError> {
        if names.is_empty() {
            return Ok(self.sources.clone());
        }
        for name in names {
            if !self.sources.iter().any(|s| s.name.eq_ignore_ascii_case(name)) {
                return Err(ConfigError::Invalid(format!("unknown or disabled source {name}")).into());
            }
        }
        Ok(self
            .sources
            .iter()
            .filter(|s| names.iter().any(|n| s.name.eq_ignore_ascii_case(n)))
            .cloned()
            .collect())
    }

    pub async fn run(
        &self,
        locations: &[LocationConfig],
        sources: &[SourceHandle],
    ) -> Result<CollectionReport, CycleError> {
        Ok(self.run_detailed(locations, sources).await?.report)
    }

    pub async fn run_detailed(
        &self,
        locations: &[LocationConfig],
        sources: &[SourceHandle],
    ) -> Result<CycleRun, CycleError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("collection_cycle", %run_id, locations = locations.len(), sources = sources.len());
        self.execute(run_id, locations, sources).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        locations: &[LocationConfig],
        sources: &[SourceHandle],
    ) -> Result<CycleRun, CycleError> {
        let started_at = Utc::now();
        let deadline = deadline_after(self.orchestrator.config().cycle_timeout());

        let mut collections = Vec::with_capacity(locations.len());
        for location in locations {
            let span = info_span!("location", location = %location.label());
            let result = self
                .orchestrator
                .collect_until(location, sources, self.per_source_limit, deadline)
                .instrument(span)
                .await;
            collections.push(result);
        }

        let mut resolver = MergeResolver::new(&self.scoring, &self.merge);
        self.preload(&mut resolver, &collections).await?;

        let mut report = CollectionReport {
            run_id,
            started_at,
            finished_at: started_at,
            locations: locations.iter().map(LocationConfig::label).collect(),
            records_fetched: 0,
            canonical_created: 0,
            auto_merged: 0,
            pending_review: 0,
            unchanged: 0,
            source_failures: Vec::new(),
            source_outcomes: Vec::new(),
            skipped_sources: self.skipped.clone(),
            persisted: 0,
            persistence_failures: Vec::new(),
            review_flags: 0,
            enriched: 0,
            enrichment_failures: 0,
        };

        let mut decisions = Vec::new();
        for collection in &collections {
            for (confidence, record) in collection.ordered_records() {
                report.records_fetched += 1;
                let outcome = resolver.resolve(record, confidence, started_at);
                match outcome {
                    MergeOutcome::Created { .. } => report.canonical_created += 1,
                    MergeOutcome::AutoMerged { .. } => report.auto_merged += 1,
                    MergeOutcome::PendingReview { .. } => report.pending_review += 1,
                    MergeOutcome::AlreadyKnown { .. } => report.unchanged += 1,
                }
                decisions.push(RecordDecision {
                    provenance: record.provenance.key(),
                    outcome,
                });
            }
            report.source_failures.extend(collection.failures.iter().cloned());
            report.source_outcomes.extend(collection.outcomes.iter().cloned());
        }

        let mut events = resolver
            .dirty_events()
            .into_iter()
            .map(|e| (e.canonical_id, e.clone()))
            .collect::<BTreeMap<_, _>>();
        let stored = self.persist(&events, &mut report).await?;

        let reviews = resolver.reviews().to_vec();
        for flag in &reviews {
            match self.gateway.flag_for_review(flag).await {
                Ok(()) => report.review_flags += 1,
                Err(err) => {
                    warn!(canonical_id = %flag.canonical_id, candidate_id = %flag.candidate_id, error = %err, "storing review flag failed");
                    report.persistence_failures.push(PersistenceFailure {
                        canonical_id: flag.canonical_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        self.enrich(&mut events, &stored, &mut report).await;

        report.finished_at = Utc::now();
        info!(
            records = report.records_fetched,
            created = report.canonical_created,
            merged = report.auto_merged,
            review = report.pending_review,
            unchanged = report.unchanged,
            failed_sources = report.source_failures.len(),
            "collection cycle finished"
        );
        Ok(CycleRun {
            report,
            events: events.into_values().collect(),
            reviews,
            decisions,
        })
    }

    /// Seed the resolver with stored events that own an incoming provenance or sit
    /// in the same city within the date window of an incoming record.
    async fn preload(
        &self,
        resolver: &mut MergeResolver,
        collections: &[CollectionResult],
    ) -> Result<(), CycleError> {
        let mut keys = BTreeSet::new();
        let mut spans: BTreeMap<String, (DateTime<Utc>, DateTime<Utc>)> = BTreeMap::new();
        for collection in collections {
            for source in &collection.fetched {
                for record in &source.records {
                    keys.insert(record.provenance.key());
                    let start = record.start_time;
                    spans
                        .entry(record.location.city_key())
                        .and_modify(|(from, to)| {
                            *from = (*from).min(start);
                            *to = (*to).max(start);
                        })
                        .or_insert((start, start));
                }
            }
        }
        if keys.is_empty() {
            return Ok(());
        }

        let keys = keys.into_iter().collect::<Vec<_>>();
        let owners = self
            .gateway
            .owners(&keys)
            .await
            .map_err(CycleError::CandidateLookup)?;
        let mut seeded = 0usize;
        for event in owners {
            seeded += usize::from(resolver.seed(event));
        }

        let reach = ChronoDuration::hours(i64::from(self.scoring.date_window_hours));
        for (city_key, (from, to)) in spans {
            let window = CandidateWindow {
                city_key,
                from: from - reach,
                to: to + reach,
            };
            let stored = self
                .gateway
                .candidates(&window)
                .await
                .map_err(CycleError::CandidateLookup)?;
            for event in stored {
                seeded += usize::from(resolver.seed(event));
            }
        }
        info!(provenance_keys = keys.len(), seeded, "preloaded stored events");
        Ok(())
    }

    /// Upsert every changed event. Fails only when every upsert failed.
    async fn persist(
        &self,
        events: &BTreeMap<Uuid, CanonicalEvent>,
        report: &mut CollectionReport,
    ) -> Result<BTreeSet<Uuid>, CycleError> {
        let mut stored = BTreeSet::new();
        let mut last_error = None;
        for (id, event) in events {
            match self.gateway.upsert(event).await {
                Ok(outcome) => {
                    stored.insert(outcome.canonical_id);
                    report.persisted += 1;
                }
                Err(err) => {
                    warn!(canonical_id = %id, error = %err, "upsert failed");
                    report.persistence_failures.push(PersistenceFailure {
                        canonical_id: *id,
                        error: err.to_string(),
                    });
                    last_error = Some(err.to_string());
                }
            }
        }
        match last_error {
            Some(last_error) if stored.is_empty() => Err(CycleError::PersistenceUnavailable {
                failed: events.len(),
                last_error,
            }),
            _ => Ok(stored),
        }
    }

    async fn enrich(
        &self,
        events: &mut BTreeMap<Uuid, CanonicalEvent>,
        stored: &BTreeSet<Uuid>,
        report: &mut CollectionReport,
    ) {
        let hook = self.enrichment.name().to_string();
        for id in stored {
            let Some(event) = events.get_mut(id) else {
                continue;
            };
            let enrichment = match self.enrichment.enrich(event) {
                Ok(enrichment) => enrichment,
                Err(err) => {
                    warn!(canonical_id = %id, hook = %hook, error = %err, "enrichment failed");
                    report.enrichment_failures += 1;
                    continue;
                }
            };
            let mut enriched = event.clone();
            if !apply_enrichment(&mut enriched, &enrichment, &hook, Utc::now()) {
                continue;
            }
            match self.gateway.upsert(&enriched).await {
                Ok(_) => {
                    *event = enriched;
                    report.enriched += 1;
                }
                Err(err) => {
                    warn!(canonical_id = %id, error = %err, "storing enriched event failed");
                    report.enrichment_failures += 1;
                }
            }
        }
    }
}
