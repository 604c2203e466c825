//! Subscribed online repositories and their last fetched indexes.

use std::path::PathBuf;
use std::sync::Arc;

use extbridge_models::{ExtensionDescriptor, RemoteRepository};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::downloader::RepositoryDownloader;
use crate::error::BridgeError;
use crate::folder::write_atomic;
use crate::identity::repository_id;
use crate::manager::ExtensionManager;

const INDEX_SUFFIXES: &[&str] = &["index.min.json", "index.json"];

/// Canonical form of a repository URL: no index file name, no trailing slash.
pub fn normalize_url(url: &str) -> Result<String, BridgeError> {
    let mut normalized = url.trim().trim_end_matches('/');
    for suffix in INDEX_SUFFIXES {
        if let Some(stripped) = normalized.strip_suffix(suffix) {
            normalized = stripped.trim_end_matches('/');
            break;
        }
    }

    let parsed = url::Url::parse(normalized)
        .map_err(|e| BridgeError::InvalidUrl(format!("'{url}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(BridgeError::InvalidUrl(format!(
            "only HTTP(S) repositories are allowed, got scheme '{}' in '{url}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(BridgeError::InvalidUrl(format!("repository URL has no host: '{url}'")));
    }
    Ok(normalized.to_string())
}

/// Outcome of [`RepositoryManager::refresh_all`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshReport {
    /// URLs fetched successfully.
    pub refreshed: Vec<String>,
    /// URLs that failed, with the error.
    pub failed: Vec<(String, String)>,
    /// Packages updated by the auto-update pass.
    pub updated: usize,
}

pub struct RepositoryManager {
    path: PathBuf,
    downloader: Arc<dyn RepositoryDownloader>,
    extensions: Arc<ExtensionManager>,
    repositories: RwLock<Vec<RemoteRepository>>,
}

impl RepositoryManager {
    /// Load `repositories.json`.
    pub async fn open(
        config: &BridgeConfig,
        downloader: Arc<dyn RepositoryDownloader>,
        extensions: Arc<ExtensionManager>,
    ) -> Result<Self, BridgeError> {
        let path = config.repositories_file();
        let repositories: Vec<RemoteRepository> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(repositories = repositories.len(), "repository list loaded");

        Ok(Self {
            path,
            downloader,
            extensions,
            repositories: RwLock::new(repositories),
        })
    }

    async fn save(&self, repositories: &[RemoteRepository]) -> Result<(), BridgeError> {
        let json = serde_json::to_vec_pretty(repositories)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&self.path, &json).await?;
        Ok(())
    }

    /// Subscribe to a repository and fetch its index.
    ///
    /// Returns `false` if the URL is already subscribed (case-insensitive).
    pub async fn add_repository(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, BridgeError> {
        let url = normalize_url(url)?;
        let id = repository_id(&url);
        if self.repositories.read().await.iter().any(|r| r.id == id) {
            return Ok(false);
        }

        let repo = self.downloader.fetch_repository(&url, cancel).await?;

        let mut repositories = self.repositories.write().await;
        if repositories.iter().any(|r| r.id == id) {
            return Ok(false);
        }
        repositories.push(repo);
        self.save(&repositories).await?;

        tracing::info!(repository = %url, "repository added");
        Ok(true)
    }

    pub async fn remove_repository(&self, url: &str) -> Result<bool, BridgeError> {
        let id = repository_id(&normalize_url(url)?);
        let mut repositories = self.repositories.write().await;
        let before = repositories.len();
        repositories.retain(|r| r.id != id);
        if repositories.len() == before {
            return Ok(false);
        }
        self.save(&repositories).await?;
        tracing::info!(repository = %url, "repository removed");
        Ok(true)
    }

    pub async fn list_repositories(&self) -> Vec<RemoteRepository> {
        self.repositories.read().await.clone()
    }

    /// Newest listing of `package` across every subscribed repository.
    pub async fn find_extension(
        &self,
        package: &str,
    ) -> Option<(RemoteRepository, ExtensionDescriptor)> {
        let repositories = self.repositories.read().await;
        repositories
            .iter()
            .filter_map(|repo| repo.find_package(package).map(|d| (repo, d)))
            .max_by_key(|(_, d)| d.version_code)
            .map(|(repo, d)| (repo.clone(), d.clone()))
    }

    /// Re-fetch every subscription in parallel, then run the auto-update pass.
    ///
    /// A failing repository keeps its previous index and records the error.
    pub async fn refresh_all(&self, cancel: &CancellationToken) -> Result<RefreshReport, BridgeError> {
        let urls: Vec<String> = self
            .repositories
            .read()
            .await
            .iter()
            .map(|r| r.url.clone())
            .collect();

        let mut tasks = JoinSet::new();
        for url in urls {
            let downloader = self.downloader.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = downloader.fetch_repository(&url, &cancel).await;
                (url, result)
            });
        }

        let mut fetched = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => fetched.push(outcome),
                Err(e) => tracing::error!("repository refresh task failed: {e}"),
            }
        }
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let mut report = RefreshReport::default();
        let snapshot = {
            let mut repositories = self.repositories.write().await;
            for (url, result) in fetched {
                let Some(current) = repositories.iter_mut().find(|r| r.url == url) else {
                    // Removed while refreshing.
                    continue;
                };
                match result {
                    Ok(repo) => {
                        *current = RemoteRepository {
                            last_error: None,
                            ..repo
                        };
                        report.refreshed.push(url);
                    }
                    Err(e) => {
                        tracing::warn!(repository = %url, "repository refresh failed: {e}");
                        current.last_error = Some(e.to_string());
                        report.failed.push((url, e.to_string()));
                    }
                }
            }
            self.save(&repositories).await?;
            repositories.clone()
        };

        report.updated = self
            .extensions
            .compare_online_with_local_and_auto_update(&snapshot, cancel)
            .await?;

        tracing::info!(
            refreshed = report.refreshed.len(),
            failed = report.failed.len(),
            updated = report.updated,
            "repositories refreshed"
        );
        Ok(report)
    }
}
