//! Threshold policy that turns incoming records into canonical events.
//!
//! Per incoming record: `Unresolved -> NewCanonical | AutoMerged | PendingReview`.
//! All decisions are made in memory; the resolver tracks which canonical events
//! changed so the caller can upsert them afterwards.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use evcat_core::{CanonicalEvent, MergeDecision, ProvenanceKey, RawEventRecord, ReviewFlag};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::{MergeConfig, ScoringConfig};
use crate::fingerprint::Fingerprinter;
use crate::similarity::{MatchScores, SimilarityScorer};

/// Terminal state of one incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Created { canonical_id: Uuid },
    AutoMerged { canonical_id: Uuid, score: f64 },
    /// Kept as its own provisional canonical event, flagged against `candidate_id`.
    PendingReview {
        canonical_id: Uuid,
        candidate_id: Uuid,
        score: f64,
    },
    /// The `(platform, url)` was already part of `canonical_id`; nothing changed.
    AlreadyKnown { canonical_id: Uuid },
}

impl MergeOutcome {
    pub fn canonical_id(&self) -> Uuid {
        match *self {
            MergeOutcome::Created { canonical_id }
            | MergeOutcome::AutoMerged { canonical_id, .. }
            | MergeOutcome::PendingReview { canonical_id, .. }
            | MergeOutcome::AlreadyKnown { canonical_id } => canonical_id,
        }
    }
}

/// Best-scoring existing event for a record, if any shares a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMatch {
    pub canonical_id: Uuid,
    pub scores: MatchScores,
}

pub struct MergeResolver {
    scorer: SimilarityScorer,
    merge_threshold: f64,
    review_threshold: f64,
    catalog: Vec<CanonicalEvent>,
    slots: HashMap<Uuid, usize>,
    provenance: HashMap<ProvenanceKey, usize>,
    fingerprints: Fingerprinter,
    dirty: BTreeSet<Uuid>,
    reviews: Vec<ReviewFlag>,
}

impl MergeResolver {
    pub fn new(scoring: &ScoringConfig, merge: &MergeConfig) -> Self {
        Self {
            scorer: SimilarityScorer::new(scoring),
            merge_threshold: merge.merge_threshold,
            review_threshold: merge.review_threshold,
            catalog: Vec::new(),
            slots: HashMap::new(),
            provenance: HashMap::new(),
            fingerprints: Fingerprinter::new(),
            dirty: BTreeSet::new(),
            reviews: Vec::new(),
        }
    }

    /// Make an already persisted event available for matching. Returns `false` if
    /// it was known already.
    pub fn seed(&mut self, event: CanonicalEvent) -> bool {
        if self.slots.contains_key(&event.canonical_id) {
            return false;
        }
        self.push(event);
        true
    }

    fn push(&mut self, event: CanonicalEvent) -> usize {
        let slot = self.catalog.len();
        self.slots.insert(event.canonical_id, slot);
        for key in event.sources.keys() {
            self.provenance.entry(key).or_insert(slot);
        }
        self.fingerprints.insert(&event, slot);
        self.catalog.push(event);
        slot
    }

    pub fn best_match(&self, record: &RawEventRecord) -> Option<BestMatch> {
        let mut best: Option<BestMatch> = None;
        for slot in self.fingerprints.candidates(record) {
            let existing = &self.catalog[slot];
            let scores = self.scorer.score(existing, record);
            let better = match &best {
                None => true,
                Some(current) => {
                    scores.aggregate > current.scores.aggregate
                        || (scores.aggregate == current.scores.aggregate
                            && existing.canonical_id < current.canonical_id)
                }
            };
            if better {
                best = Some(BestMatch {
                    canonical_id: existing.canonical_id,
                    scores,
                });
            }
        }
        best
    }

    /// What would happen to `record`, without applying it.
    pub fn decide(&self, record: &RawEventRecord) -> MergeDecision {
        self.decision(record).0
    }

    /// The decision plus the score behind it. The score is `None` when the
    /// record's provenance is already part of the target event.
    fn decision(&self, record: &RawEventRecord) -> (MergeDecision, Option<f64>) {
        if let Some(&slot) = self.provenance.get(&record.provenance.key()) {
            return (MergeDecision::MergeInto(self.catalog[slot].canonical_id), None);
        }
        match self.best_match(record) {
            Some(m) if m.scores.aggregate >= self.merge_threshold => {
                (MergeDecision::MergeInto(m.canonical_id), Some(m.scores.aggregate))
            }
            Some(m) if m.scores.aggregate >= self.review_threshold => (
                MergeDecision::FlagForReview(m.canonical_id, m.scores.aggregate),
                Some(m.scores.aggregate),
            ),
            m => (MergeDecision::NewCanonical, m.map(|m| m.scores.aggregate)),
        }
    }

    /// Apply `record` with the given source confidence.
    pub fn resolve(&mut self, record: &RawEventRecord, confidence: f64, at: DateTime<Utc>) -> MergeOutcome {
        let key = record.provenance.key();
        match self.decision(record) {
            (MergeDecision::MergeInto(canonical_id), None) => {
                debug!(provenance = %key, %canonical_id, "provenance already merged");
                MergeOutcome::AlreadyKnown { canonical_id }
            }
            (MergeDecision::MergeInto(canonical_id), Some(score)) => {
                self.absorb_into(canonical_id, record, confidence, at);
                debug!(provenance = %key, %canonical_id, score, "auto-merged");
                MergeOutcome::AutoMerged { canonical_id, score }
            }
            (MergeDecision::FlagForReview(candidate_id, score), _) => {
                let canonical_id = self.create(record, confidence, at);
                self.reviews.push(ReviewFlag {
                    canonical_id,
                    candidate_id,
                    score,
                    flagged_at: at,
                });
                debug!(provenance = %key, %canonical_id, %candidate_id, score, "flagged for review");
                MergeOutcome::PendingReview {
                    canonical_id,
                    candidate_id,
                    score,
                }
            }
            (MergeDecision::NewCanonical, _) => MergeOutcome::Created {
                canonical_id: self.create(record, confidence, at),
            },
        }
    }

    fn create(&mut self, record: &RawEventRecord, confidence: f64, at: DateTime<Utc>) -> Uuid {
        let event = CanonicalEvent::from_record(record, confidence, at);
        let canonical_id = event.canonical_id;
        // Only reachable when a stored event was seeded without its first provenance entry.
        if self.slots.contains_key(&canonical_id) {
            self.absorb_into(canonical_id, record, confidence, at);
            return canonical_id;
        }
        self.push(event);
        self.dirty.insert(canonical_id);
        canonical_id
    }

    fn absorb_into(&mut self, canonical_id: Uuid, record: &RawEventRecord, confidence: f64, at: DateTime<Utc>) {
        let Some(&slot) = self.slots.get(&canonical_id) else {
            return;
        };
        if self.catalog[slot].absorb(record, confidence, at) {
            self.provenance.insert(record.provenance.key(), slot);
            self.fingerprints.insert(&self.catalog[slot], slot);
            self.dirty.insert(canonical_id);
        }
    }

    pub fn get(&self, canonical_id: Uuid) -> Option<&CanonicalEvent> {
        self.slots.get(&canonical_id).map(|&slot| &self.catalog[slot])
    }

    pub fn events(&self) -> &[CanonicalEvent] {
        &self.catalog
    }

    /// Events created or changed since construction, ordered by id.
    pub fn dirty_events(&self) -> Vec<&CanonicalEvent> {
        self.dirty.iter().filter_map(|id| self.get(*id)).collect()
    }

    pub fn reviews(&self) -> &[ReviewFlag] {
        &self.reviews
    }
}
