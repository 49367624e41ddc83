//! File tracker (spec §3, §4.5): per-`(store, path)` record of the last
//! indexed content hash, used to skip unchanged reindex and compute sync
//! deletions. Persisted as one JSON file per store, same atomic
//! write-then-rename discipline as the registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedFile {
    pub path: String,
    pub content_hash: String,
    pub size: u64,
    pub indexed_at_ms: u128,
    pub chunk_count: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerSnapshot {
    files: HashMap<String, TrackedFile>,
}

pub struct FileTracker {
    data_dir: PathBuf,
    per_store: RwLock<HashMap<String, RwLock<TrackerSnapshot>>>,
}

impl FileTracker {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), per_store: RwLock::new(HashMap::new()) }
    }

    fn path_for(&self, store: &str) -> PathBuf {
        self.data_dir.join("file-tracker").join(format!("{store}.json"))
    }

    fn load_store(&self, store: &str) -> CoreResult<()> {
        if self.per_store.read().unwrap().contains_key(store) {
            return Ok(());
        }
        let path = self.path_for(store);
        let snapshot = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| CoreError::Internal(format!("failed to read {}: {e}", path.display())))?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            TrackerSnapshot::default()
        };
        self.per_store.write().unwrap().insert(store.to_string(), RwLock::new(snapshot));
        Ok(())
    }

    fn persist(&self, store: &str) -> CoreResult<()> {
        let dir = self.data_dir.join("file-tracker");
        std::fs::create_dir_all(&dir)
            .map_err(|e| CoreError::Internal(format!("failed to create {}: {e}", dir.display())))?;
        let per_store = self.per_store.read().unwrap();
        let snapshot = per_store.get(store).unwrap().read().unwrap();
        let json = serde_json::to_string_pretty(&*snapshot)
            .map_err(|e| CoreError::Internal(format!("failed to serialize tracker: {e}")))?;
        let final_path = self.path_for(store);
        let tmp_path = dir.join(format!("{store}.json.tmp-{}", uuid::Uuid::new_v4()));
        std::fs::write(&tmp_path, json)
            .map_err(|e| CoreError::Internal(format!("failed to write {}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| CoreError::Internal(format!("failed to rename into {}: {e}", final_path.display())))?;
        Ok(())
    }

    pub fn get(&self, store: &str, path: &str) -> CoreResult<Option<TrackedFile>> {
        self.load_store(store)?;
        let per_store = self.per_store.read().unwrap();
        Ok(per_store.get(store).unwrap().read().unwrap().files.get(path).cloned())
    }

    pub fn paths(&self, store: &str) -> CoreResult<Vec<String>> {
        self.load_store(store)?;
        let per_store = self.per_store.read().unwrap();
        Ok(per_store.get(store).unwrap().read().unwrap().files.keys().cloned().collect())
    }

    /// Commits a batch of successfully-indexed files atomically.
    pub fn commit_batch(&self, store: &str, files: Vec<TrackedFile>) -> CoreResult<()> {
        self.load_store(store)?;
        {
            let per_store = self.per_store.read().unwrap();
            let mut snapshot = per_store.get(store).unwrap().write().unwrap();
            for file in files {
                snapshot.files.insert(file.path.clone(), file);
            }
        }
        self.persist(store)
    }

    pub fn remove(&self, store: &str, paths: &[String]) -> CoreResult<usize> {
        self.load_store(store)?;
        let removed;
        {
            let per_store = self.per_store.read().unwrap();
            let mut snapshot = per_store.get(store).unwrap().write().unwrap();
            removed = paths.iter().filter(|p| snapshot.files.remove(p.as_str()).is_some()).count();
        }
        self.persist(store)?;
        Ok(removed)
    }

    pub fn remove_by_prefix(&self, store: &str, prefix: &str) -> CoreResult<usize> {
        self.load_store(store)?;
        let removed;
        {
            let per_store = self.per_store.read().unwrap();
            let mut snapshot = per_store.get(store).unwrap().write().unwrap();
            let matching: Vec<String> =
                snapshot.files.keys().filter(|p| p.starts_with(prefix)).cloned().collect();
            for p in &matching {
                snapshot.files.remove(p);
            }
            removed = matching.len();
        }
        self.persist(store)?;
        Ok(removed)
    }

    /// Computes `tracked_paths \ current_paths` for `Sync`.
    pub fn missing_from(&self, store: &str, current_paths: &[String]) -> CoreResult<Vec<String>> {
        self.load_store(store)?;
        let per_store = self.per_store.read().unwrap();
        let snapshot = per_store.get(store).unwrap().read().unwrap();
        let current: std::collections::HashSet<&str> = current_paths.iter().map(|s| s.as_str()).collect();
        Ok(snapshot.files.keys().filter(|p| !current.contains(p.as_str())).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, hash: &str) -> TrackedFile {
        TrackedFile { path: path.to_string(), content_hash: hash.to_string(), size: 10, indexed_at_ms: 0, chunk_count: 1 }
    }

    #[test]
    fn commit_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path());
        tracker.commit_batch("demo", vec![file("a.rs", "h1")]).unwrap();
        let tracked = tracker.get("demo", "a.rs").unwrap().unwrap();
        assert_eq!(tracked.content_hash, "h1");
    }

    #[test]
    fn sync_computes_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path());
        tracker.commit_batch("demo", vec![file("a.rs", "h1"), file("b.rs", "h2")]).unwrap();
        let missing = tracker.missing_from("demo", &["a.rs".to_string()]).unwrap();
        assert_eq!(missing, vec!["b.rs".to_string()]);
    }

    #[test]
    fn remove_by_prefix_drops_matching() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path());
        tracker.commit_batch("demo", vec![file("src/a.rs", "h1"), file("docs/b.md", "h2")]).unwrap();
        let removed = tracker.remove_by_prefix("demo", "src/").unwrap();
        assert_eq!(removed, 1);
        assert!(tracker.get("demo", "src/a.rs").unwrap().is_none());
        assert!(tracker.get("demo", "docs/b.md").unwrap().is_some());
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tracker = FileTracker::new(dir.path());
            tracker.commit_batch("demo", vec![file("a.rs", "h1")]).unwrap();
        }
        let reloaded = FileTracker::new(dir.path());
        assert!(reloaded.get("demo", "a.rs").unwrap().is_some());
    }
}
