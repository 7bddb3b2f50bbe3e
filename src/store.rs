//! Persisted orchestration state.
//!
//! Two separate documents are kept: [`ProjectState`] lives next to the
//! project (release counter, key distribution flags, fingerprint baselines)
//! and [`HostState`] lives in the operator's config dir and is shared by
//! every project on this machine (server registry, control-server bootstrap
//! flags, global defaults). Both are read and written whole.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::registry::ServerDefinition;

pub trait Store<T>: Send + Sync {
    fn load(&self) -> Result<T>;
    fn save(&self, value: &T) -> Result<()>;
}

impl<'a, T> dyn Store<T> + 'a {
    /// Read, mutate, write. No isolation between concurrent writers.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut value = self.load()?;
        let out = f(&mut value);
        self.save(&value)?;
        Ok(out)
    }
}

/// Whole-document JSON file. A missing file reads as `T::default()`.
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> Store<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    fn load(&self) -> Result<T> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", self.path.display(), e))
        })
    }

    fn save(&self, value: &T) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let content = serde_json::to_string_pretty(value)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

/// In-memory store, used by tests in place of the JSON documents.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore<T> {
    value: std::sync::Mutex<T>,
}

#[cfg(test)]
impl<T: Clone + Send> Store<T> for MemoryStore<T> {
    fn load(&self) -> Result<T> {
        let guard = self
            .value
            .lock()
            .map_err(|_| Error::Config("state store lock poisoned".into()))?;
        Ok(guard.clone())
    }

    fn save(&self, value: &T) -> Result<()> {
        let mut guard = self
            .value
            .lock()
            .map_err(|_| Error::Config("state store lock poisoned".into()))?;
        *guard = value.clone();
        Ok(())
    }
}

/// Project-scoped state (`.appctl/database.json`).
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    #[serde(default)]
    pub latest_release_num: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_unique_id: Option<String>,
    /// target -> server id -> control key installed
    #[serde(default)]
    pub control_key_copied: BTreeMap<String, BTreeMap<String, bool>>,
    /// target -> server id -> fingerprint seen on the last deploy
    #[serde(default)]
    pub last_fingerprint: BTreeMap<String, BTreeMap<String, String>>,
}

impl ProjectState {
    pub fn key_copied(&self, target: &str, server_id: &str) -> bool {
        self.control_key_copied
            .get(target)
            .and_then(|servers| servers.get(server_id))
            .copied()
            .unwrap_or(false)
    }

    pub fn set_key_copied(&mut self, target: &str, server_id: &str, copied: bool) {
        self.control_key_copied
            .entry(target.to_string())
            .or_default()
            .insert(server_id.to_string(), copied);
    }

    /// A new control key invalidates every earlier installation for the target.
    pub fn clear_key_copied_for_target(&mut self, target: &str) {
        if let Some(servers) = self.control_key_copied.get_mut(target) {
            for copied in servers.values_mut() {
                *copied = false;
            }
        }
    }

    /// Clears the flag for one server across every target that knows it.
    pub fn clear_key_copied_for_server(&mut self, server_id: &str) {
        for servers in self.control_key_copied.values_mut() {
            if let Some(copied) = servers.get_mut(server_id) {
                *copied = false;
            }
        }
    }

    pub fn last_fingerprint(&self, target: &str, server_id: &str) -> Option<&str> {
        self.last_fingerprint
            .get(target)
            .and_then(|servers| servers.get(server_id))
            .map(String::as_str)
    }

    pub fn set_last_fingerprint(&mut self, target: &str, server_id: &str, fingerprint: &str) {
        self.last_fingerprint
            .entry(target.to_string())
            .or_default()
            .insert(server_id.to_string(), fingerprint.to_string());
    }
}

/// Host-global state (`<config_dir>/appctl/global.json`).
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostState {
    /// group name -> servers in registration order
    #[serde(default)]
    pub servers: BTreeMap<String, Vec<ServerDefinition>>,
    /// server id -> control server bootstrapped
    #[serde(default)]
    pub control_server_init: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts_dir: Option<String>,
}

impl HostState {
    pub fn control_server_initialised(&self, server_id: &str) -> bool {
        self.control_server_init
            .get(server_id)
            .copied()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::<ProjectState>::new(dir.path().join("database.json"));
        assert_eq!(store.load().unwrap(), ProjectState::default());
    }

    #[test]
    fn test_json_store_update_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".appctl").join("database.json");
        let store: Arc<dyn Store<ProjectState>> = Arc::new(JsonFileStore::new(&path));

        store.update(|s| s.latest_release_num = 3).unwrap();
        store
            .update(|s| s.set_key_copied("production", "id-1", true))
            .unwrap();

        let reread = JsonFileStore::<ProjectState>::new(&path).load().unwrap();
        assert_eq!(reread.latest_release_num, 3);
        assert!(reread.key_copied("production", "id-1"));

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("latestReleaseNum"));
    }

    #[test]
    fn test_clear_flags_for_server_across_targets() {
        let mut state = ProjectState::default();
        state.set_key_copied("production", "a", true);
        state.set_key_copied("staging", "a", true);
        state.set_key_copied("staging", "b", true);

        state.clear_key_copied_for_server("a");

        assert!(!state.key_copied("production", "a"));
        assert!(!state.key_copied("staging", "a"));
        assert!(state.key_copied("staging", "b"));
    }

    #[test]
    fn test_clear_flags_for_target() {
        let mut state = ProjectState::default();
        state.set_key_copied("production", "a", true);
        state.set_key_copied("staging", "a", true);

        state.clear_key_copied_for_target("production");

        assert!(!state.key_copied("production", "a"));
        assert!(state.key_copied("staging", "a"));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store: Arc<dyn Store<HostState>> = Arc::new(MemoryStore::default());
        store
            .update(|s| {
                s.control_server_init.insert("x".into(), true);
            })
            .unwrap();
        assert!(store.load().unwrap().control_server_initialised("x"));
        assert!(!store.load().unwrap().control_server_initialised("y"));
    }
}
