//! Installed extension versions and the groups that collect them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptor::ExtensionDescriptor;

/// Content hash of a pipeline artifact plus the toolchain version that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHash {
    pub file_name: String,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
    pub version: u32,
}

impl ArtifactHash {
    pub fn new(file_name: impl Into<String>, sha256: impl Into<String>, version: u32) -> Self {
        Self {
            file_name: file_name.into(),
            sha256: sha256.into(),
            version,
        }
    }
}

/// One concrete installed version of an extension.
///
/// Identity is the hash of the raw package bytes. Everything except the
/// archive/module artifact hashes is fixed once the entry is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryEntry {
    /// Id of the online repository this version came from, `None` when sideloaded.
    #[serde(default)]
    pub repository_id: Option<String>,
    pub is_local: bool,
    pub name: String,
    /// Entry point declared by the package manifest.
    pub entry_point: String,
    pub extension: ExtensionDescriptor,
    #[serde(default)]
    pub download_url: Option<String>,
    pub downloaded_at: DateTime<Utc>,
    pub package: ArtifactHash,
    #[serde(default)]
    pub archive: Option<ArtifactHash>,
    #[serde(default)]
    pub module: Option<ArtifactHash>,
}

impl RepositoryEntry {
    pub fn id(&self) -> &str {
        &self.package.sha256
    }

    pub fn version(&self) -> &str {
        &self.extension.version
    }

    pub fn version_code(&self) -> i64 {
        self.extension.version_code
    }
}

/// Every installed version of one extension package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryGroup {
    /// Package id shared by all entries (e.g. `eu.kanade.tachiyomi.extension.en.foo`).
    pub package: String,
    pub name: String,
    #[serde(default)]
    pub active_entry: Option<usize>,
    #[serde(default = "default_auto_update")]
    pub auto_update: bool,
    #[serde(default)]
    pub entries: Vec<RepositoryEntry>,
}

fn default_auto_update() -> bool {
    true
}

impl RepositoryGroup {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
            active_entry: None,
            auto_update: true,
            entries: Vec::new(),
        }
    }

    pub fn active(&self) -> Option<&RepositoryEntry> {
        self.active_entry.and_then(|idx| self.entries.get(idx))
    }

    pub fn position(&self, entry_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == entry_id)
    }

    pub fn find_entry(&self, entry_id: &str) -> Option<&RepositoryEntry> {
        self.entries.iter().find(|e| e.id() == entry_id)
    }

    /// Entry with the highest version code.
    pub fn latest(&self) -> Option<&RepositoryEntry> {
        self.entries.iter().max_by_key(|e| e.version_code())
    }

    /// Remove an entry by id, keeping `active_entry` pointing at the same entry.
    ///
    /// Returns the removed entry and whether it was the active one.
    pub fn remove_entry(&mut self, entry_id: &str) -> Option<(RepositoryEntry, bool)> {
        let idx = self.position(entry_id)?;
        let removed = self.entries.remove(idx);
        let was_active = self.active_entry == Some(idx);
        self.active_entry = match self.active_entry {
            Some(active) if active == idx => None,
            Some(active) if active > idx => Some(active - 1),
            other => other,
        };
        Some((removed, was_active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, code: i64) -> RepositoryEntry {
        RepositoryEntry {
            repository_id: None,
            is_local: true,
            name: "Test".into(),
            entry_point: ".TestSource".into(),
            extension: ExtensionDescriptor {
                name: "Test".into(),
                package: "a.b.test".into(),
                version: format!("1.4.{code}"),
                version_code: code,
                ..Default::default()
            },
            download_url: None,
            downloaded_at: Utc::now(),
            package: ArtifactHash::new("package.wasm", hash, 1),
            archive: None,
            module: None,
        }
    }

    #[test]
    fn test_latest_picks_highest_version_code() {
        let mut group = RepositoryGroup::new("a.b.test", "Test");
        group.entries.push(entry("h1", 3));
        group.entries.push(entry("h2", 7));
        group.entries.push(entry("h3", 5));
        assert_eq!(group.latest().unwrap().id(), "h2");
    }

    #[test]
    fn test_remove_entry_before_active_shifts_index() {
        let mut group = RepositoryGroup::new("a.b.test", "Test");
        group.entries.push(entry("h1", 1));
        group.entries.push(entry("h2", 2));
        group.active_entry = Some(1);

        let (removed, was_active) = group.remove_entry("h1").unwrap();
        assert_eq!(removed.id(), "h1");
        assert!(!was_active);
        assert_eq!(group.active().unwrap().id(), "h2");
    }

    #[test]
    fn test_remove_active_entry_clears_active() {
        let mut group = RepositoryGroup::new("a.b.test", "Test");
        group.entries.push(entry("h1", 1));
        group.entries.push(entry("h2", 2));
        group.active_entry = Some(0);

        let (_, was_active) = group.remove_entry("h1").unwrap();
        assert!(was_active);
        assert!(group.active().is_none());
        assert_eq!(group.entries.len(), 1);
    }

    #[test]
    fn test_remove_unknown_entry() {
        let mut group = RepositoryGroup::new("a.b.test", "Test");
        assert!(group.remove_entry("nope").is_none());
    }

    #[test]
    fn test_group_defaults_auto_update_on_deserialize() {
        let group: RepositoryGroup =
            serde_json::from_str(r#"{"package":"a.b","name":"B"}"#).unwrap();
        assert!(group.auto_update);
        assert!(group.active_entry.is_none());
    }
}
