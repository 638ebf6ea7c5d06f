//! The persisted-state collaborator: id, handle, image ref, workspace
//! path, env, declared ports, last-known public ports, enabled flag,
//! created timestamp, per §6 "Persisted state". The engine only needs a
//! trait to call at startup and on mutation; this module also ships a
//! JSON-on-disk implementation so the daemon runs standalone.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backend::ExposePortSpec;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedInstance {
    pub id: String,
    pub handle_alias: Option<String>,
    pub parent_id: Option<String>,
    pub image_ref: Option<String>,
    pub workspace_path: Option<String>,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub expose_ports: Vec<ExposePortSpec>,
    pub last_known_public_ports: Vec<(u16, u16)>,
    pub enabled: bool,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn load_all(&self) -> Result<Vec<PersistedInstance>>;
    async fn save(&self, instance: &PersistedInstance) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// JSON-file-per-instance registry under `<state_dir>/instances/<id>.json`.
pub struct DiskRegistry {
    dir: PathBuf,
    // Serializes writes so concurrent `save` calls don't interleave
    // partial files.
    lock: Mutex<()>,
}

impl DiskRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), lock: Mutex::new(()) }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(Error::Io)
    }
}

#[async_trait]
impl InstanceRegistry for DiskRegistry {
    async fn load_all(&self) -> Result<Vec<PersistedInstance>> {
        self.ensure_dir().await?;
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(Error::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::Io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(Error::Io)?;
            match serde_json::from_slice::<PersistedInstance>(&bytes) {
                Ok(inst) => out.push(inst),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt registry entry");
                }
            }
        }
        Ok(out)
    }

    async fn save(&self, instance: &PersistedInstance) -> Result<()> {
        self.ensure_dir().await?;
        let _guard = self.lock.lock().await;
        let path = self.path_for(&instance.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(instance)?;
        tokio::fs::write(&tmp, bytes).await.map_err(Error::Io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(Error::Io)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// An in-memory registry used by tests that don't care about durability.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: Mutex<Vec<PersistedInstance>>,
}

#[async_trait]
impl InstanceRegistry for MemoryRegistry {
    async fn load_all(&self) -> Result<Vec<PersistedInstance>> {
        Ok(self.entries.lock().await.clone())
    }

    async fn save(&self, instance: &PersistedInstance) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.iter_mut().find(|e| e.id == instance.id) {
            *existing = instance.clone();
        } else {
            entries.push(instance.clone());
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.entries.lock().await.retain(|e| e.id != id);
        Ok(())
    }
}

#[allow(dead_code)]
fn is_json(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> PersistedInstance {
        PersistedInstance {
            id: id.to_string(),
            handle_alias: None,
            parent_id: None,
            image_ref: None,
            workspace_path: None,
            command: vec!["true".into()],
            env: vec![],
            expose_ports: vec![],
            last_known_public_ports: vec![],
            enabled: true,
            memory_mb: 128,
            vcpus: 1,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn disk_registry_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = DiskRegistry::new(tmp.path());
        registry.save(&sample("i1")).await.unwrap();
        let loaded = registry.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "i1");
    }

    #[tokio::test]
    async fn disk_registry_delete_removes_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = DiskRegistry::new(tmp.path());
        registry.save(&sample("i1")).await.unwrap();
        registry.delete("i1").await.unwrap();
        assert!(registry.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_registry_save_overwrites_existing() {
        let registry = MemoryRegistry::default();
        registry.save(&sample("i1")).await.unwrap();
        let mut updated = sample("i1");
        updated.enabled = false;
        registry.save(&updated).await.unwrap();
        let loaded = registry.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].enabled);
    }
}
