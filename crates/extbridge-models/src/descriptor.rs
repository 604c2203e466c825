//! Read-only metadata published by remote extension repositories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One extension as listed in a repository's `index.min.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    pub name: String,
    #[serde(rename = "pkg")]
    pub package: String,
    /// File name of the package under the repository's `apk/` folder.
    #[serde(rename = "apk", default)]
    pub package_file: String,
    #[serde(rename = "lang", default)]
    pub language: String,
    #[serde(rename = "code", default)]
    pub version_code: i64,
    pub version: String,
    /// Content rating flag, `1` when the extension serves adult content.
    #[serde(default)]
    pub nsfw: i32,
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

impl ExtensionDescriptor {
    /// Display name without the conventional `Tachiyomi: ` prefix.
    pub fn display_name(&self) -> &str {
        self.name
            .strip_prefix("Tachiyomi: ")
            .unwrap_or(&self.name)
    }

    pub fn is_nsfw(&self) -> bool {
        self.nsfw != 0
    }
}

/// A source declared by an extension in the remote index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    #[serde(rename = "lang")]
    pub language: String,
    pub id: String,
    #[serde(rename = "baseUrl", default)]
    pub base_url: String,
    #[serde(rename = "versionId", default)]
    pub version_id: i32,
}

/// Source metadata reported by a loaded extension module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub id: i64,
    pub name: String,
    #[serde(rename = "lang")]
    pub language: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub version_id: i32,
    #[serde(default)]
    pub supports_latest: bool,
    #[serde(default)]
    pub configurable: bool,
}

impl From<&SourceInfo> for SourceDescriptor {
    fn from(info: &SourceInfo) -> Self {
        Self {
            name: info.name.clone(),
            language: info.language.clone(),
            id: info.id.to_string(),
            base_url: info.base_url.clone(),
            version_id: info.version_id,
        }
    }
}

/// A subscribed remote repository and the last index successfully fetched from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRepository {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// Error from the most recent refresh, cleared on the next success.
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub extensions: Vec<ExtensionDescriptor>,
}

impl RemoteRepository {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            name: None,
            website: None,
            fingerprint: None,
            last_updated: None,
            last_error: None,
            extensions: Vec::new(),
        }
    }

    pub fn find_package(&self, package: &str) -> Option<&ExtensionDescriptor> {
        self.extensions.iter().find(|e| e.package == package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX_ENTRY: &str = r#"{
        "name": "Tachiyomi: MangaDex",
        "pkg": "eu.kanade.tachiyomi.extension.all.mangadex",
        "apk": "tachiyomi-all.mangadex-v1.4.12.apk",
        "lang": "all",
        "code": 12,
        "version": "1.4.12",
        "nsfw": 1,
        "sources": [
            {"name": "MangaDex", "lang": "en", "id": "2499283573021220255", "baseUrl": "https://mangadex.org", "versionId": 1}
        ]
    }"#;

    #[test]
    fn test_deserialize_index_entry() {
        let ext: ExtensionDescriptor = serde_json::from_str(INDEX_ENTRY).unwrap();
        assert_eq!(ext.package, "eu.kanade.tachiyomi.extension.all.mangadex");
        assert_eq!(ext.package_file, "tachiyomi-all.mangadex-v1.4.12.apk");
        assert_eq!(ext.version_code, 12);
        assert!(ext.is_nsfw());
        assert_eq!(ext.sources.len(), 1);
        assert_eq!(ext.sources[0].base_url, "https://mangadex.org");
    }

    #[test]
    fn test_display_name_strips_prefix() {
        let ext: ExtensionDescriptor = serde_json::from_str(INDEX_ENTRY).unwrap();
        assert_eq!(ext.display_name(), "MangaDex");

        let plain = ExtensionDescriptor {
            name: "Comick".into(),
            ..Default::default()
        };
        assert_eq!(plain.display_name(), "Comick");
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let ext: ExtensionDescriptor =
            serde_json::from_str(r#"{"name":"X","pkg":"a.b","version":"1.0"}"#).unwrap();
        assert!(ext.sources.is_empty());
        assert_eq!(ext.version_code, 0);
        assert!(!ext.is_nsfw());
    }

    #[test]
    fn test_find_package() {
        let mut repo = RemoteRepository::new("id", "https://example.com/repo");
        repo.extensions
            .push(serde_json::from_str(INDEX_ENTRY).unwrap());
        assert!(repo
            .find_package("eu.kanade.tachiyomi.extension.all.mangadex")
            .is_some());
        assert!(repo.find_package("missing").is_none());
    }
}
