//! Store/version registry (spec §4.2).
//!
//! Stores are named tenants holding an append-only, status-mutable list of
//! versions. Exactly one version is ever `active`. Metadata persists as one
//! JSON file per store under `{data_dir}/stores/{store}/metadata.json`,
//! written via temp-file-then-rename so a crash mid-write never corrupts the
//! previous snapshot.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::VersionConfig;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Building,
    Ready,
    Active,
    Deprecated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: String,
    pub status: VersionStatus,
    pub config: VersionConfig,
    pub created_at_ms: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub versions: Vec<VersionRecord>,
    pub active_version: Option<String>,
}

impl StoreRecord {
    fn new(name: &str, description: &str) -> Self {
        Self { name: name.to_string(), description: description.to_string(), versions: Vec::new(), active_version: None }
    }

    fn next_version_id(&self) -> String {
        format!("v{}", self.versions.len() + 1)
    }

    fn find(&self, id: &str) -> Option<&VersionRecord> {
        self.versions.iter().find(|v| v.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut VersionRecord> {
        self.versions.iter_mut().find(|v| v.id == id)
    }
}

/// Resolved physical names for a `(store, version)` pair (spec §6 collection naming).
#[derive(Debug, Clone)]
pub struct ResolvedVersion {
    pub store: String,
    pub version: String,
    pub dense_collection: String,
    pub sparse_index: String,
    pub config: VersionConfig,
}

struct StoreSlot {
    record: RwLock<StoreRecord>,
    lock: Mutex<()>,
}

pub struct Registry {
    data_dir: PathBuf,
    collection_prefix: String,
    stores: RwLock<HashMap<String, Arc<StoreSlot>>>,
}

impl Registry {
    pub fn new(data_dir: impl Into<PathBuf>, collection_prefix: impl Into<String>) -> CoreResult<Self> {
        let registry = Self {
            data_dir: data_dir.into(),
            collection_prefix: collection_prefix.into(),
            stores: RwLock::new(HashMap::new()),
        };
        registry.reload_from_disk()?;
        Ok(registry)
    }

    fn stores_root(&self) -> PathBuf {
        self.data_dir.join("stores")
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.stores_root().join(name).join("metadata.json")
    }

    fn quarantine_path(&self, name: &str) -> PathBuf {
        self.stores_root().join(name).join("metadata.json.quarantined")
    }

    /// Reloads every store's metadata file. Malformed files are quarantined
    /// (renamed aside) rather than silently dropped or accepted.
    fn reload_from_disk(&self) -> CoreResult<()> {
        let root = self.stores_root();
        if !root.exists() {
            return Ok(());
        }
        let entries = std::fs::read_dir(&root)
            .map_err(|e| CoreError::Internal(format!("failed to list {}: {e}", root.display())))?;
        let mut stores = self.stores.write().unwrap();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let path = self.metadata_path(&name);
            if !path.exists() {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(store = %name, error = %e, "failed to read store metadata");
                    continue;
                }
            };
            match serde_json::from_str::<StoreRecord>(&raw) {
                Ok(record) => {
                    stores.insert(name.clone(), Arc::new(StoreSlot { record: RwLock::new(record), lock: Mutex::new(()) }));
                }
                Err(e) => {
                    tracing::error!(store = %name, error = %e, "quarantining malformed store metadata");
                    let _ = std::fs::rename(&path, self.quarantine_path(&name));
                }
            }
        }
        Ok(())
    }

    fn persist(&self, record: &StoreRecord) -> CoreResult<()> {
        let dir = self.stores_root().join(&record.name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| CoreError::Internal(format!("failed to create {}: {e}", dir.display())))?;
        let final_path = dir.join("metadata.json");
        let tmp_path = dir.join(format!("metadata.json.tmp-{}", uuid::Uuid::new_v4()));
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| CoreError::Internal(format!("failed to serialize store metadata: {e}")))?;
        std::fs::write(&tmp_path, json)
            .map_err(|e| CoreError::Internal(format!("failed to write {}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| CoreError::Internal(format!("failed to rename into {}: {e}", final_path.display())))?;
        Ok(())
    }

    fn slot(&self, name: &str) -> CoreResult<Arc<StoreSlot>> {
        self.stores
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("store '{name}' does not exist")))
    }

    /// Creates a store and, per spec §4.2's "initialize default store on
    /// first use", bootstraps it with an immediately-active `v1` built from
    /// `VersionConfig::default()` so a fresh store is indexable and
    /// searchable without a separate create/ready/promote round-trip.
    /// Later versions (`v2`, …) still go through the explicit
    /// building → ready → promote lifecycle via [`Self::create_version`].
    pub fn create_store(&self, name: &str, description: &str) -> CoreResult<()> {
        crate::config::validate_store_name(name)?;
        let mut stores = self.stores.write().unwrap();
        if stores.contains_key(name) {
            return Err(CoreError::conflict(format!("store '{name}' already exists")));
        }
        let mut record = StoreRecord::new(name, description);
        let bootstrap = VersionRecord {
            id: record.next_version_id(),
            status: VersionStatus::Active,
            config: VersionConfig::default(),
            created_at_ms: crate::util::unix_timestamp_ms(),
        };
        record.active_version = Some(bootstrap.id.clone());
        record.versions.push(bootstrap);
        self.persist(&record)?;
        stores.insert(name.to_string(), Arc::new(StoreSlot { record: RwLock::new(record), lock: Mutex::new(()) }));
        Ok(())
    }

    /// Creates the named store if it does not already exist, idempotently.
    pub fn ensure_store(&self, name: &str) -> CoreResult<()> {
        if self.stores.read().unwrap().contains_key(name) {
            return Ok(());
        }
        match self.create_store(name, "") {
            Ok(()) | Err(CoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn list_stores(&self) -> Vec<StoreRecord> {
        self.stores.read().unwrap().values().map(|s| s.record.read().unwrap().clone()).collect()
    }

    pub fn get_store(&self, name: &str) -> CoreResult<StoreRecord> {
        Ok(self.slot(name)?.record.read().unwrap().clone())
    }

    pub fn delete_store(&self, name: &str) -> CoreResult<()> {
        let slot = self.slot(name)?;
        let _guard = slot.lock.lock().unwrap();
        let record = slot.record.read().unwrap();
        if record.versions.iter().any(|v| v.status == VersionStatus::Active) {
            return Err(CoreError::conflict("cannot delete a store with an active version"));
        }
        drop(record);
        drop(_guard);
        self.stores.write().unwrap().remove(name);
        let dir = self.stores_root().join(name);
        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    pub fn create_version(&self, store: &str, config: VersionConfig) -> CoreResult<VersionRecord> {
        config.validate()?;
        let slot = self.slot(store)?;
        let _guard = slot.lock.lock().unwrap();
        let mut record = slot.record.write().unwrap();
        if record.versions.iter().any(|v| v.status == VersionStatus::Building) {
            return Err(CoreError::conflict("a version is already building for this store"));
        }
        let version = VersionRecord {
            id: record.next_version_id(),
            status: VersionStatus::Building,
            config,
            created_at_ms: crate::util::unix_timestamp_ms(),
        };
        record.versions.push(version.clone());
        self.persist(&record)?;
        Ok(version)
    }

    pub fn mark_ready(&self, store: &str, version: &str) -> CoreResult<()> {
        let slot = self.slot(store)?;
        let _guard = slot.lock.lock().unwrap();
        let mut record = slot.record.write().unwrap();
        let v = record
            .find_mut(version)
            .ok_or_else(|| CoreError::not_found(format!("version '{version}' not found")))?;
        if v.status != VersionStatus::Building {
            return Err(CoreError::conflict("only a building version can be marked ready"));
        }
        v.status = VersionStatus::Ready;
        self.persist(&record)?;
        Ok(())
    }

    /// Atomically promotes `version` to active, demoting the previous active
    /// version (if any) to deprecated.
    pub fn promote(&self, store: &str, version: &str) -> CoreResult<()> {
        let slot = self.slot(store)?;
        let _guard = slot.lock.lock().unwrap();
        let mut record = slot.record.write().unwrap();
        {
            let v = record
                .find(version)
                .ok_or_else(|| CoreError::not_found(format!("version '{version}' not found")))?;
            if v.status != VersionStatus::Ready {
                return Err(CoreError::conflict("only a ready version may be promoted"));
            }
        }
        let previous = record.active_version.clone();
        if let Some(prev) = &previous {
            if let Some(v) = record.find_mut(prev) {
                v.status = VersionStatus::Deprecated;
            }
        }
        record.find_mut(version).unwrap().status = VersionStatus::Active;
        record.active_version = Some(version.to_string());
        self.persist(&record)?;
        Ok(())
    }

    pub fn deprecate(&self, store: &str, version: &str) -> CoreResult<()> {
        let slot = self.slot(store)?;
        let _guard = slot.lock.lock().unwrap();
        let mut record = slot.record.write().unwrap();
        let is_active = record.active_version.as_deref() == Some(version);
        let v = record
            .find_mut(version)
            .ok_or_else(|| CoreError::not_found(format!("version '{version}' not found")))?;
        v.status = VersionStatus::Deprecated;
        if is_active {
            record.active_version = None;
        }
        self.persist(&record)?;
        Ok(())
    }

    pub fn delete_version(&self, store: &str, version: &str) -> CoreResult<()> {
        let slot = self.slot(store)?;
        let _guard = slot.lock.lock().unwrap();
        let mut record = slot.record.write().unwrap();
        let v = record
            .find(version)
            .ok_or_else(|| CoreError::not_found(format!("version '{version}' not found")))?;
        if v.status == VersionStatus::Active {
            return Err(CoreError::conflict("cannot delete the active version"));
        }
        record.versions.retain(|v| v.id != version);
        self.persist(&record)?;
        Ok(())
    }

    /// Resolves `(store, version)` to physical collection names and config.
    /// `version = None` resolves to the store's current active version.
    pub fn resolve(&self, store: &str, version: Option<&str>) -> CoreResult<ResolvedVersion> {
        let record = self.get_store(store)?;
        let version_id = match version {
            Some(v) => v.to_string(),
            None => record
                .active_version
                .clone()
                .ok_or_else(|| CoreError::not_found(format!("store '{store}' has no active version")))?,
        };
        let v = record
            .find(&version_id)
            .ok_or_else(|| CoreError::not_found(format!("version '{version_id}' not found")))?;
        Ok(ResolvedVersion {
            store: store.to_string(),
            version: version_id.clone(),
            dense_collection: format!("{}{}_{}", self.collection_prefix, store, version_id),
            sparse_index: format!("{}{}_{}_sparse", self.collection_prefix, store, version_id),
            config: v.config.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path(), "").unwrap();
        (dir, registry)
    }

    #[test]
    fn create_store_bootstraps_an_active_default_version() {
        let (_dir, registry) = registry();
        registry.create_store("demo", "").unwrap();
        let resolved = registry.resolve("demo", None).unwrap();
        assert_eq!(resolved.version, "v1");
        assert_eq!(resolved.dense_collection, "demo_v1");
        let record = registry.get_store("demo").unwrap();
        assert_eq!(record.active_version.as_deref(), Some("v1"));
        assert_eq!(record.find("v1").unwrap().status, VersionStatus::Active);
    }

    #[test]
    fn promote_requires_ready() {
        let (_dir, registry) = registry();
        registry.create_store("demo", "").unwrap();
        registry.create_version("demo", VersionConfig::default()).unwrap();
        assert!(registry.promote("demo", "v2").is_err());
    }

    #[test]
    fn promote_demotes_previous_active() {
        let (_dir, registry) = registry();
        registry.create_store("demo", "").unwrap();

        registry.create_version("demo", VersionConfig::default()).unwrap();
        registry.mark_ready("demo", "v2").unwrap();
        registry.promote("demo", "v2").unwrap();

        let record = registry.get_store("demo").unwrap();
        assert_eq!(record.active_version.as_deref(), Some("v2"));
        assert_eq!(record.find("v1").unwrap().status, VersionStatus::Deprecated);
        assert_eq!(record.find("v2").unwrap().status, VersionStatus::Active);
    }

    #[test]
    fn cannot_delete_active_version() {
        let (_dir, registry) = registry();
        registry.create_store("demo", "").unwrap();
        assert!(registry.delete_version("demo", "v1").is_err());
    }

    #[test]
    fn reload_picks_up_persisted_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = Registry::new(dir.path(), "").unwrap();
            registry.create_store("demo", "persisted").unwrap();
        }
        let reloaded = Registry::new(dir.path(), "").unwrap();
        let record = reloaded.get_store("demo").unwrap();
        assert_eq!(record.description, "persisted");
    }

    #[test]
    fn malformed_metadata_is_quarantined_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("stores").join("broken");
        std::fs::create_dir_all(&store_dir).unwrap();
        std::fs::write(store_dir.join("metadata.json"), "{not valid json").unwrap();

        let registry = Registry::new(dir.path(), "").unwrap();
        assert!(registry.get_store("broken").is_err());
        assert!(store_dir.join("metadata.json.quarantined").exists());
    }
}
