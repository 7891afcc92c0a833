//! Storage & persistence.
//!
//! A string key/value backend ([`KeyValueStore`]) plus [`SessionStore`], which
//! remembers the last connector and network per namespace. Failures never
//! reach callers: a read error or a corrupted record is treated as "no prior
//! session" and a failed write is logged.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::caip::{CaipNetworkId, ChainNamespace};
use crate::constants::{
    DEFAULT_STORAGE_PREFIX, STORAGE_ACTIVE_NAMESPACE, STORAGE_ACTIVE_NETWORK_SUFFIX,
    STORAGE_SESSION_SUFFIX,
};
use crate::error::Result;

pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    items: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.lock().map_err(|_| "memory store poisoned")?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.lock().map_err(|_| "memory store poisoned")?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = self.items.lock().map_err(|_| "memory store poisoned")?;
        items.remove(key);
        Ok(())
    }
}

/// A JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(map)?)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().map_err(|_| "file store poisoned")?;
        Ok(self.read_map()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| "file store poisoned")?;
        // A corrupted file is replaced rather than blocking every write.
        let mut map = self.read_map().unwrap_or_default();
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| "file store poisoned")?;
        let mut map = self.read_map().unwrap_or_default();
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

/// What survives a reload for one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(rename = "connectorId")]
    pub connector_id: String,
    #[serde(rename = "networkId")]
    pub network_id: CaipNetworkId,
}

#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self::with_prefix(backend, DEFAULT_STORAGE_PREFIX)
    }

    pub fn with_prefix(backend: Arc<dyn KeyValueStore>, prefix: &str) -> Self {
        Self {
            backend,
            prefix: prefix.to_string(),
        }
    }

    fn session_key(&self, namespace: ChainNamespace) -> String {
        format!("{}{namespace}{STORAGE_SESSION_SUFFIX}", self.prefix)
    }

    fn active_network_key(&self, namespace: ChainNamespace) -> String {
        format!("{}{namespace}{STORAGE_ACTIVE_NETWORK_SUFFIX}", self.prefix)
    }

    fn active_namespace_key(&self) -> String {
        format!("{}{STORAGE_ACTIVE_NAMESPACE}", self.prefix)
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.backend.get_item(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("Unable to read {key}: {e}");
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str) {
        if let Err(e) = self.backend.set_item(key, value) {
            warn!("Unable to write {key}: {e}");
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.backend.remove_item(key) {
            warn!("Unable to remove {key}: {e}");
        }
    }

    pub fn save(&self, namespace: ChainNamespace, session: &PersistedSession) {
        match serde_json::to_string(session) {
            Ok(json) => self.write(&self.session_key(namespace), &json),
            Err(e) => warn!("Unable to encode {namespace} session: {e}"),
        }
    }

    /// Returns `None` for absent, unparsable, or cross-namespace records.
    pub fn load(&self, namespace: ChainNamespace) -> Option<PersistedSession> {
        let raw = self.read(&self.session_key(namespace))?;
        match serde_json::from_str::<PersistedSession>(&raw) {
            Ok(session) if session.network_id.namespace == namespace => Some(session),
            Ok(session) => {
                warn!(
                    "Ignoring {namespace} session pointing at network {}",
                    session.network_id
                );
                None
            }
            Err(e) => {
                debug!("Ignoring corrupted {namespace} session {raw:?}: {e}");
                None
            }
        }
    }

    pub fn clear(&self, namespace: ChainNamespace) {
        self.remove(&self.session_key(namespace));
    }

    pub fn save_active_network(&self, id: &CaipNetworkId) {
        self.write(&self.active_network_key(id.namespace), &id.to_string());
    }

    pub fn load_active_network(&self, namespace: ChainNamespace) -> Option<CaipNetworkId> {
        let raw = self.read(&self.active_network_key(namespace))?;
        raw.parse::<CaipNetworkId>()
            .ok()
            .filter(|id| id.namespace == namespace)
    }

    pub fn save_active_namespace(&self, namespace: Option<ChainNamespace>) {
        match namespace {
            Some(ns) => self.write(&self.active_namespace_key(), ns.as_str()),
            None => self.remove(&self.active_namespace_key()),
        }
    }

    pub fn load_active_namespace(&self) -> Option<ChainNamespace> {
        self.read(&self.active_namespace_key())?.parse().ok()
    }
}
