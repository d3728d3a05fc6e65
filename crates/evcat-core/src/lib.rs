//! Core event model and provenance types for the event catalog.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod error;
pub mod text;

pub use error::{SourceError, SourceErrorKind};

pub const CRATE_NAME: &str = "evcat-core";

/// Where a listing was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProvenance {
    pub platform: String,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

impl SourceProvenance {
    pub fn key(&self) -> ProvenanceKey {
        ProvenanceKey::new(&self.platform, &self.url)
    }
}

/// Identity of a provenance entry: `(platform, url)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProvenanceKey {
    pub platform: String,
    pub url: String,
}

impl ProvenanceKey {
    pub fn new(platform: &str, url: &str) -> Self {
        Self {
            platform: platform.trim().to_ascii_lowercase(),
            url: url.trim().to_string(),
        }
    }
}

impl fmt::Display for ProvenanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.platform, self.url)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLocation {
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

impl EventLocation {
    pub fn new(city: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            country: country.into(),
            ..Default::default()
        }
    }

    pub fn city_key(&self) -> String {
        text::normalize_city(&self.city)
    }

    /// Both coordinates present and finite.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }

    /// Copy fields that are blank here but populated in `other`. Never overwrites.
    pub fn fill_gaps(&mut self, other: &EventLocation) {
        if self.city.trim().is_empty() {
            self.city = other.city.clone();
        }
        if self.country.trim().is_empty() {
            self.country = other.country.clone();
        }
        fill_optional_text(&mut self.state, &other.state);
        fill_optional_text(&mut self.venue, &other.venue);
        fill_optional_text(&mut self.address, &other.address);
        if self.coordinates().is_none() {
            if let Some((lat, lon)) = other.coordinates() {
                self.lat = Some(lat);
                self.lon = Some(lon);
            }
        }
    }
}

fn fill_optional_text(slot: &mut Option<String>, other: &Option<String>) {
    let blank = slot.as_deref().map(|s| s.trim().is_empty()).unwrap_or(true);
    if blank {
        if let Some(value) = other.as_deref().and_then(text::non_empty) {
            *slot = Some(value);
        }
    }
}

/// Source-local listing as produced by an adapter. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEventRecord {
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
    pub provenance: SourceProvenance,
}

/// Which source supplied a canonical field value, and how much it is trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEvidence {
    pub platform: String,
    pub url: String,
    pub confidence: f64,
}

impl FieldEvidence {
    pub fn from_provenance(provenance: &SourceProvenance, confidence: f64) -> Self {
        Self {
            platform: provenance.platform.clone(),
            url: provenance.url.clone(),
            confidence,
        }
    }
}

/// Canonical field value with the evidence that put it there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributed<T> {
    pub value: T,
    pub evidence: FieldEvidence,
}

impl<T> Attributed<T> {
    pub fn new(value: T, evidence: FieldEvidence) -> Self {
        Self { value, evidence }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvenanceSetError {
    #[error("a canonical event needs at least one source")]
    Empty,
    #[error("duplicate provenance entry {0}")]
    Duplicate(ProvenanceKey),
}

/// Non-empty, `(platform, url)`-unique set of provenance entries in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<SourceProvenance>", into = "Vec<SourceProvenance>")]
pub struct ProvenanceSet(Vec<SourceProvenance>);

impl ProvenanceSet {
    pub fn new(first: SourceProvenance) -> Self {
        Self(vec![first])
    }

    pub fn contains(&self, key: &ProvenanceKey) -> bool {
        self.0.iter().any(|p| &p.key() == key)
    }

    /// Returns `false` (and leaves the set untouched) when the key is already present.
    pub fn insert(&mut self, provenance: SourceProvenance) -> bool {
        if self.contains(&provenance.key()) {
            return false;
        }
        self.0.push(provenance);
        true
    }

    pub fn first(&self) -> &SourceProvenance {
        &self.0[0]
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceProvenance> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = ProvenanceKey> + '_ {
        self.0.iter().map(SourceProvenance::key)
    }
}

impl TryFrom<Vec<SourceProvenance>> for ProvenanceSet {
    type Error = ProvenanceSetError;

    fn try_from(entries: Vec<SourceProvenance>) -> Result<Self, Self::Error> {
        let mut iter = entries.into_iter();
        let first = iter.next().ok_or(ProvenanceSetError::Empty)?;
        let mut set = ProvenanceSet::new(first);
        for entry in iter {
            let key = entry.key();
            if !set.insert(entry) {
                return Err(ProvenanceSetError::Duplicate(key));
            }
        }
        Ok(set)
    }
}

impl From<ProvenanceSet> for Vec<SourceProvenance> {
    fn from(set: ProvenanceSet) -> Self {
        set.0
    }
}

/// Reconciled, persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub canonical_id: Uuid,
    pub title: Attributed<String>,
    #[serde(default)]
    pub description: Option<Attributed<String>>,
    pub start_time: Attributed<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<Attributed<DateTime<Utc>>>,
    pub location: Attributed<EventLocation>,
    #[serde(default)]
    pub price: Option<Attributed<String>>,
    #[serde(default)]
    pub category: Option<Attributed<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub sources: ProvenanceSet,
    #[serde(default)]
    pub enrichment_confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalEvent {
    /// Stable identity for an event first observed at `key`.
    pub fn identity_for(key: &ProvenanceKey) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("evcat:{key}").as_bytes())
    }

    pub fn from_record(record: &RawEventRecord, confidence: f64, at: DateTime<Utc>) -> Self {
        let evidence = FieldEvidence::from_provenance(&record.provenance, confidence);
        let mut tags = Vec::new();
        merge_tags(&mut tags, &record.tags);
        Self {
            canonical_id: Self::identity_for(&record.provenance.key()),
            title: Attributed::new(record.title.trim().to_string(), evidence.clone()),
            description: text::non_empty(&record.description)
                .map(|d| Attributed::new(d, evidence.clone())),
            start_time: Attributed::new(record.start_time, evidence.clone()),
            end_time: record
                .end_time
                .map(|t| Attributed::new(t, evidence.clone())),
            location: Attributed::new(record.location.clone(), evidence.clone()),
            price: record
                .price
                .as_deref()
                .and_then(text::non_empty)
                .map(|p| Attributed::new(p, evidence.clone())),
            category: record
                .category
                .as_deref()
                .and_then(text::non_empty)
                .map(|c| Attributed::new(c, evidence)),
            tags,
            sources: ProvenanceSet::new(record.provenance.clone()),
            enrichment_confidence: None,
            created_at: at,
            updated_at: at,
        }
    }

    /// Fold `record` into this event. A record whose `(platform, url)` is already
    /// present is a no-op and returns `false`.
    pub fn absorb(&mut self, record: &RawEventRecord, confidence: f64, at: DateTime<Utc>) -> bool {
        if self.sources.contains(&record.provenance.key()) {
            return false;
        }
        let evidence = FieldEvidence::from_provenance(&record.provenance, confidence);

        if let Some(title) = text::non_empty(&record.title) {
            refine_required(&mut self.title, title, &evidence);
        }
        refine_required(&mut self.start_time, record.start_time, &evidence);
        refine_optional(&mut self.description, text::non_empty(&record.description), &evidence);
        refine_optional(&mut self.end_time, record.end_time, &evidence);
        refine_optional(
            &mut self.price,
            record.price.as_deref().and_then(text::non_empty),
            &evidence,
        );
        refine_optional(
            &mut self.category,
            record.category.as_deref().and_then(text::non_empty),
            &evidence,
        );

        if evidence.confidence > self.location.evidence.confidence {
            let previous = std::mem::replace(
                &mut self.location,
                Attributed::new(record.location.clone(), evidence),
            );
            self.location.value.fill_gaps(&previous.value);
        } else {
            self.location.value.fill_gaps(&record.location);
        }

        merge_tags(&mut self.tags, &record.tags);
        self.sources.insert(record.provenance.clone());
        self.updated_at = at;
        true
    }

    pub fn title(&self) -> &str {
        &self.title.value
    }

    pub fn description(&self) -> &str {
        self.description
            .as_ref()
            .map(|d| d.value.as_str())
            .unwrap_or_default()
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start_time.value
    }

    pub fn location(&self) -> &EventLocation {
        &self.location.value
    }
}

fn refine_required<T>(slot: &mut Attributed<T>, value: T, evidence: &FieldEvidence) {
    if evidence.confidence > slot.evidence.confidence {
        *slot = Attributed::new(value, evidence.clone());
    }
}

fn refine_optional<T>(slot: &mut Option<Attributed<T>>, value: Option<T>, evidence: &FieldEvidence) {
    let Some(value) = value else {
        return;
    };
    match slot {
        Some(current) if current.evidence.confidence >= evidence.confidence => {}
        _ => *slot = Some(Attributed::new(value, evidence.clone())),
    }
}

fn merge_tags(tags: &mut Vec<String>, incoming: &[String]) {
    for tag in incoming {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags.sort();
}

/// Outcome of a merge decision for one incoming record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MergeDecision {
    NewCanonical,
    MergeInto(Uuid),
    FlagForReview(Uuid, f64),
}

/// A probable-but-unconfirmed duplicate relationship held for manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFlag {
    pub canonical_id: Uuid,
    pub candidate_id: Uuid,
    pub score: f64,
    pub flagged_at: DateTime<Utc>,
}
