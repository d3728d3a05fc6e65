use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use evcat_core::{CanonicalEvent, ProvenanceKey, ReviewFlag};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    merge_for_upsert, CandidateWindow, PersistenceError, PersistenceGateway, UpsertOutcome,
};

/// One JSON document per canonical event under `<root>/events`, review flags under
/// `<root>/reviews`. Every write goes to a temp file first and is renamed into place.
#[derive(Debug)]
pub struct FileGateway {
    root: PathBuf,
    owners: Mutex<Option<HashMap<ProvenanceKey, Uuid>>>,
}

impl FileGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            owners: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    fn reviews_dir(&self) -> PathBuf {
        self.root.join("reviews")
    }

    fn event_path(&self, canonical_id: Uuid) -> PathBuf {
        self.events_dir().join(format!("{canonical_id}.json"))
    }

    async fn read_event(&self, canonical_id: Uuid) -> Result<Option<CanonicalEvent>, PersistenceError> {
        let path = self.event_path(canonical_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }

    async fn read_all_events(&self) -> Result<Vec<CanonicalEvent>, PersistenceError> {
        let dir = self.events_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(PersistenceError::Io { path: dir, source }),
        };

        let mut events = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| PersistenceError::Io {
                path: dir.clone(),
                source,
            })?;
            let Some(entry) = entry else {
                break;
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            events.push(read_json::<CanonicalEvent>(&path).await?);
        }
        events.sort_by_key(|e| e.canonical_id);
        Ok(events)
    }

    async fn owner_index<'a>(
        &self,
        slot: &'a mut Option<HashMap<ProvenanceKey, Uuid>>,
    ) -> Result<&'a mut HashMap<ProvenanceKey, Uuid>, PersistenceError> {
        if slot.is_none() {
            let mut index = HashMap::new();
            for event in self.read_all_events().await? {
                for key in event.sources.keys() {
                    index.insert(key, event.canonical_id);
                }
            }
            debug!(root = %self.root.display(), entries = index.len(), "loaded provenance index");
            *slot = Some(index);
        }
        Ok(slot.get_or_insert_with(HashMap::new))
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    let bytes = fs::read(path).await.map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write via a sibling temp file and an atomic rename.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PersistenceError::Io { path, source }
    };
    let bytes = serde_json::to_vec_pretty(value)?;
    let parent = path
        .parent()
        .ok_or_else(|| PersistenceError::Unavailable(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent).await.map_err(io_err(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(&bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        if let Err(cleanup) = fs::remove_file(&temp_path).await {
            warn!(path = %temp_path.display(), error = %cleanup, "leaving temp file behind");
        }
        return Err(PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

#[async_trait]
impl PersistenceGateway for FileGateway {
    async fn upsert(&self, event: &CanonicalEvent) -> Result<UpsertOutcome, PersistenceError> {
        let mut slot = self.owners.lock().await;
        let index = self.owner_index(&mut *slot).await?;
        let id = event.canonical_id;

        let stored = self.read_event(id).await?;
        let merged = merge_for_upsert(stored.as_ref(), event);
        for key in merged.sources.keys() {
            if let Some(&owner) = index.get(&key) {
                if owner != id {
                    return Err(PersistenceError::Conflict { key, owner });
                }
            }
        }

        write_json_atomic(&self.event_path(id), &merged).await?;
        for key in merged.sources.keys() {
            index.insert(key, id);
        }
        Ok(UpsertOutcome {
            canonical_id: id,
            created: stored.is_none(),
        })
    }

    async fn candidates(
        &self,
        window: &CandidateWindow,
    ) -> Result<Vec<CanonicalEvent>, PersistenceError> {
        Ok(self
            .read_all_events()
            .await?
            .into_iter()
            .filter(|e| window.contains(e))
            .collect())
    }

    async fn owners(&self, keys: &[ProvenanceKey]) -> Result<Vec<CanonicalEvent>, PersistenceError> {
        let mut ids = {
            let mut slot = self.owners.lock().await;
            let index = self.owner_index(&mut *slot).await?;
            keys.iter()
                .filter_map(|k| index.get(k).copied())
                .collect::<Vec<_>>()
        };
        ids.sort();
        ids.dedup();

        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(event) = self.read_event(id).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<(), PersistenceError> {
        let path = self
            .reviews_dir()
            .join(format!("{}_{}.json", flag.canonical_id, flag.candidate_id));
        write_json_atomic(&path, flag).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{at, event, record};
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn events_round_trip_through_disk_and_reopen() {
        let dir = tempdir().expect("tempdir");
        let gateway = FileGateway::new(dir.path());
        let mut ev = event("meetup", "https://m/1", "Austin", 20);
        ev.absorb(&record("eventbrite", "https://e/1", "Austin", 20), 0.6, at(2, 0));

        assert!(gateway.upsert(&ev).await.unwrap().created);
        assert!(!gateway.upsert(&ev).await.unwrap().created);

        let reopened = FileGateway::new(dir.path());
        let owners = reopened
            .owners(&[ProvenanceKey::new("eventbrite", "https://e/1")])
            .await
            .unwrap();
        assert_eq!(owners, vec![ev.clone()]);

        let window = CandidateWindow {
            city_key: "austin".into(),
            from: at(20, 0),
            to: at(21, 0),
        };
        assert_eq!(reopened.candidates(&window).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_temp_files_survive_a_write() {
        let dir = tempdir().expect("tempdir");
        let gateway = FileGateway::new(dir.path());
        gateway
            .upsert(&event("meetup", "https://m/1", "Austin", 20))
            .await
            .unwrap();
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir.path().join("events")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json") && !names[0].starts_with('.'));
    }

    #[tokio::test]
    async fn conflicting_owner_is_rejected_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let a = event("meetup", "https://m/1", "Austin", 20);
        FileGateway::new(dir.path()).upsert(&a).await.unwrap();

        let mut b = event("eventbrite", "https://e/1", "Austin", 20);
        b.absorb(&record("meetup", "https://m/1", "Austin", 20), 0.5, at(2, 0));
        let err = FileGateway::new(dir.path()).upsert(&b).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict { .. }));
    }
}
