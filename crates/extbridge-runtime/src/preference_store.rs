//! Persisted key/value preferences, one file per source.
//!
//! A store reads its file into memory on first access and rewrites it
//! atomically on every mutation. All access goes through one async mutex,
//! so read-modify-write cycles never interleave. A file that fails to parse
//! is treated as empty and overwritten by the next write; a file that cannot
//! be read is an error and is left alone. A failed write leaves the cached
//! values as they were.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use extbridge_models::Preference;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::PreferenceError;
use crate::folder::write_atomic;

/// A stored preference value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Bool(bool),
    Long(i64),
    String(String),
}

impl PreferenceValue {
    /// Value to persist for a preference edited through its declaration.
    ///
    /// Switch and checkbox widgets store booleans; everything else stores text.
    pub fn from_preference(preference: &Preference) -> Option<Self> {
        let value = preference.current_value.as_deref()?;
        let is_toggle = matches!(
            preference.kind.as_str(),
            "SwitchPreferenceCompat" | "SwitchPreference" | "CheckBoxPreference"
        );
        if is_toggle {
            if let Ok(b) = value.parse::<bool>() {
                return Some(Self::Bool(b));
            }
        }
        Some(Self::String(value.to_string()))
    }

    /// Text form, as shown in a preference's `current_value`.
    pub fn as_text(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Long(n) => n.to_string(),
            Self::String(s) => s.clone(),
        }
    }
}

pub type PreferenceMap = BTreeMap<String, PreferenceValue>;

// ─── Store ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PreferenceStore {
    path: PathBuf,
    cache: AsyncMutex<Option<PreferenceMap>>,
}

impl PreferenceStore {
    /// Nothing is read until the first access.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: AsyncMutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<PreferenceMap, PreferenceError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PreferenceMap::new()),
            Err(e) => {
                tracing::error!(path = %self.path.display(), "failed to read preference store: {e}");
                return Err(e.into());
            }
        };

        match serde_json::from_slice(&data) {
            Ok(map) => Ok(map),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "preference store is corrupt, resetting to empty: {e}"
                );
                Ok(PreferenceMap::new())
            }
        }
    }

    async fn read<T>(&self, f: impl FnOnce(&PreferenceMap) -> T) -> Result<T, PreferenceError> {
        let mut cache = self.cache.lock().await;
        if let Some(map) = cache.as_ref() {
            return Ok(f(map));
        }
        let map = self.read_file().await?;
        Ok(f(cache.insert(map)))
    }

    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut PreferenceMap) -> T,
    ) -> Result<T, PreferenceError> {
        let mut cache = self.cache.lock().await;
        let mut map = match cache.as_ref() {
            Some(map) => map.clone(),
            None => self.read_file().await?,
        };

        let out = f(&mut map);
        self.persist(&map).await?;
        *cache = Some(map);
        Ok(out)
    }

    async fn persist(&self, map: &PreferenceMap) -> Result<(), PreferenceError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(map)?;
        write_atomic(&self.path, &json).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<PreferenceValue>, PreferenceError> {
        self.read(|m| m.get(key).cloned()).await
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>, PreferenceError> {
        Ok(match self.get(key).await? {
            Some(PreferenceValue::String(s)) => Some(s),
            _ => None,
        })
    }

    pub async fn get_long(&self, key: &str) -> Result<Option<i64>, PreferenceError> {
        Ok(match self.get(key).await? {
            Some(PreferenceValue::Long(n)) => Some(n),
            _ => None,
        })
    }

    pub async fn get_bool(&self, key: &str) -> Result<Option<bool>, PreferenceError> {
        Ok(match self.get(key).await? {
            Some(PreferenceValue::Bool(b)) => Some(b),
            _ => None,
        })
    }

    pub async fn all(&self) -> Result<PreferenceMap, PreferenceError> {
        self.read(|m| m.clone()).await
    }

    pub async fn set(&self, key: &str, value: PreferenceValue) -> Result<(), PreferenceError> {
        self.mutate(|m| {
            m.insert(key.to_string(), value);
        })
        .await
    }

    pub async fn set_string(&self, key: &str, value: &str) -> Result<(), PreferenceError> {
        self.set(key, PreferenceValue::String(value.to_string()))
            .await
    }

    pub async fn set_long(&self, key: &str, value: i64) -> Result<(), PreferenceError> {
        self.set(key, PreferenceValue::Long(value)).await
    }

    pub async fn set_bool(&self, key: &str, value: bool) -> Result<(), PreferenceError> {
        self.set(key, PreferenceValue::Bool(value)).await
    }

    /// Returns whether the key was present.
    pub async fn remove(&self, key: &str) -> Result<bool, PreferenceError> {
        self.mutate(|m| m.remove(key).is_some()).await
    }
}

// ─── Registry ───────────────────────────────────────────────────────────

/// Hands out one shared store per `(package, source)` so every loaded
/// instance of a package writes through the same in-memory copy.
#[derive(Debug)]
pub struct PreferenceRegistry {
    root: PathBuf,
    stores: Mutex<HashMap<(String, i64), Arc<PreferenceStore>>>,
}

impl PreferenceRegistry {
    /// `root` is the extensions directory; files land in `<root>/<package>/preferences/`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, package: &str, source_id: i64) -> Arc<PreferenceStore> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores
            .entry((package.to_string(), source_id))
            .or_insert_with(|| {
                let path = self
                    .root
                    .join(package)
                    .join("preferences")
                    .join(format!("{source_id}.json"));
                Arc::new(PreferenceStore::new(path))
            })
            .clone()
    }

    /// Forget cached stores of a removed package.
    pub fn forget(&self, package: &str) {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores.retain(|(p, _), _| p != package);
    }
}
