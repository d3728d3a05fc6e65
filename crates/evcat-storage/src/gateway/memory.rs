use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use evcat_core::{CanonicalEvent, ProvenanceKey, ReviewFlag};
use uuid::Uuid;

use super::{
    merge_for_upsert, CandidateWindow, PersistenceError, PersistenceGateway, UpsertOutcome,
};

#[derive(Debug, Default)]
struct MemoryState {
    events: BTreeMap<Uuid, CanonicalEvent>,
    owners: HashMap<ProvenanceKey, Uuid>,
    reviews: BTreeMap<(Uuid, Uuid), ReviewFlag>,
}

/// In-process catalog. Used by tests and by runs without a configured backend.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<CanonicalEvent> {
        self.lock().events.values().cloned().collect()
    }

    pub fn get(&self, canonical_id: Uuid) -> Option<CanonicalEvent> {
        self.lock().events.get(&canonical_id).cloned()
    }

    pub fn reviews(&self) -> Vec<ReviewFlag> {
        self.lock().reviews.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn upsert(&self, event: &CanonicalEvent) -> Result<UpsertOutcome, PersistenceError> {
        let mut state = self.lock();
        let id = event.canonical_id;
        let merged = merge_for_upsert(state.events.get(&id), event);

        for key in merged.sources.keys() {
            if let Some(&owner) = state.owners.get(&key) {
                if owner != id {
                    return Err(PersistenceError::Conflict { key, owner });
                }
            }
        }
        for key in merged.sources.keys() {
            state.owners.insert(key, id);
        }
        let created = state.events.insert(id, merged).is_none();
        Ok(UpsertOutcome {
            canonical_id: id,
            created,
        })
    }

    async fn candidates(
        &self,
        window: &CandidateWindow,
    ) -> Result<Vec<CanonicalEvent>, PersistenceError> {
        Ok(self
            .lock()
            .events
            .values()
            .filter(|e| window.contains(e))
            .cloned()
            .collect())
    }

    async fn owners(&self, keys: &[ProvenanceKey]) -> Result<Vec<CanonicalEvent>, PersistenceError> {
        let state = self.lock();
        let mut ids = keys
            .iter()
            .filter_map(|k| state.owners.get(k).copied())
            .collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.events.get(&id).cloned())
            .collect())
    }

    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<(), PersistenceError> {
        self.lock()
            .reviews
            .insert((flag.canonical_id, flag.candidate_id), flag.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{at, event, record};
    use super::*;

    #[tokio::test]
    async fn upsert_twice_is_idempotent() {
        let gateway = MemoryGateway::new();
        let mut ev = event("meetup", "https://m/1", "Austin", 20);
        ev.absorb(&record("eventbrite", "https://e/1", "Austin", 20), 0.6, at(2, 0));

        let first = gateway.upsert(&ev).await.unwrap();
        let second = gateway.upsert(&ev).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.canonical_id, second.canonical_id);
        assert_eq!(gateway.len(), 1);
        assert_eq!(gateway.get(ev.canonical_id).unwrap().sources.len(), 2);
    }

    #[tokio::test]
    async fn stored_provenance_is_never_dropped() {
        let gateway = MemoryGateway::new();
        let mut ev = event("meetup", "https://m/1", "Austin", 20);
        let stale = ev.clone();
        ev.absorb(&record("eventbrite", "https://e/1", "Austin", 20), 0.6, at(2, 0));
        gateway.upsert(&ev).await.unwrap();
        gateway.upsert(&stale).await.unwrap();
        assert_eq!(gateway.get(ev.canonical_id).unwrap().sources.len(), 2);
    }

    #[tokio::test]
    async fn provenance_owned_elsewhere_is_a_conflict() {
        let gateway = MemoryGateway::new();
        let a = event("meetup", "https://m/1", "Austin", 20);
        let mut b = event("eventbrite", "https://e/1", "Austin", 20);
        b.absorb(&record("meetup", "https://m/1", "Austin", 20), 0.5, at(2, 0));
        gateway.upsert(&a).await.unwrap();
        let err = gateway.upsert(&b).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict { owner, .. } if owner == a.canonical_id));
    }

    #[tokio::test]
    async fn candidates_and_owners_lookup() {
        let gateway = MemoryGateway::new();
        let austin = event("meetup", "https://m/1", "Austin", 20);
        let dallas = event("meetup", "https://m/2", "Dallas", 20);
        let late = event("meetup", "https://m/3", "Austin", 28);
        for ev in [&austin, &dallas, &late] {
            gateway.upsert(ev).await.unwrap();
        }

        let window = CandidateWindow {
            city_key: "austin".into(),
            from: at(19, 0),
            to: at(22, 0),
        };
        let found = gateway.candidates(&window).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].canonical_id, austin.canonical_id);

        let owners = gateway
            .owners(&[
                ProvenanceKey::new("meetup", "https://m/3"),
                ProvenanceKey::new("MEETUP", "https://m/3"),
                ProvenanceKey::new("nobody", "https://x"),
            ])
            .await
            .unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].canonical_id, late.canonical_id);
    }
}
