//! Persistence gateway contract and its implementations.
//!
//! The gateway is the sole writer of durable catalog state. Upserts are keyed by
//! `canonical_id` and merge provenance by `(platform, url)` membership, so applying
//! the same logical merge twice leaves the store unchanged.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evcat_core::{CanonicalEvent, ProvenanceKey, ReviewFlag};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod file;
mod memory;
mod postgres;

pub use file::FileGateway;
pub use memory::MemoryGateway;
pub use postgres::PgGateway;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("provenance {key} already belongs to canonical event {owner}")]
    Conflict { key: ProvenanceKey, owner: Uuid },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub canonical_id: Uuid,
    pub created: bool,
}

/// Same-city events starting inside `[from, to]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateWindow {
    pub city_key: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl CandidateWindow {
    pub fn contains(&self, event: &CanonicalEvent) -> bool {
        event.location().city_key() == self.city_key
            && event.start() >= self.from
            && event.start() <= self.to
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn upsert(&self, event: &CanonicalEvent) -> Result<UpsertOutcome, PersistenceError>;

    async fn candidates(
        &self,
        window: &CandidateWindow,
    ) -> Result<Vec<CanonicalEvent>, PersistenceError>;

    /// Canonical events that already own any of `keys`.
    async fn owners(&self, keys: &[ProvenanceKey]) -> Result<Vec<CanonicalEvent>, PersistenceError>;

    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<(), PersistenceError>;
}

/// Apply `incoming` over what is stored: fields come from `incoming`, provenance is the
/// union of both sets, and the original creation time is kept.
pub(crate) fn merge_for_upsert(
    stored: Option<&CanonicalEvent>,
    incoming: &CanonicalEvent,
) -> CanonicalEvent {
    let mut merged = incoming.clone();
    if let Some(stored) = stored {
        for provenance in stored.sources.iter() {
            merged.sources.insert(provenance.clone());
        }
        merged.created_at = stored.created_at.min(incoming.created_at);
    }
    merged
}
