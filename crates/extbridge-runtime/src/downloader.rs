//! Fetching repository indexes and packages over HTTP.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use extbridge_models::{ExtensionDescriptor, RemoteRepository};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::identity::repository_id;

/// Index files tried in order.
const INDEX_FILES: &[&str] = &["index.min.json", "index.json"];
const META_FILE: &str = "repo.json";
const PACKAGE_DIR: &str = "apk";

#[async_trait]
pub trait RepositoryDownloader: Send + Sync {
    /// Fetch the metadata and extension index of a normalized repository URL.
    async fn fetch_repository(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteRepository, BridgeError>;

    /// Download the package a descriptor points at.
    async fn download_package(
        &self,
        repo_url: &str,
        descriptor: &ExtensionDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BridgeError>;
}

#[derive(Debug, Deserialize)]
struct RepoMetaFile {
    meta: RepoMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoMeta {
    name: Option<String>,
    website: Option<String>,
    signing_key_fingerprint: Option<String>,
}

/// Package file names are joined onto the repository URL, so they must be
/// a single plain path segment.
fn validate_package_file(file: &str) -> Result<(), BridgeError> {
    if file.is_empty()
        || file.contains('/')
        || file.contains('\\')
        || file.contains("..")
        || file.contains('?')
        || file.contains('#')
    {
        return Err(BridgeError::InvalidUrl(format!(
            "invalid package file name: '{file}'"
        )));
    }
    Ok(())
}

/// Where a descriptor's package lives inside a repository.
pub fn package_url(repo_url: &str, descriptor: &ExtensionDescriptor) -> String {
    format!("{repo_url}/{PACKAGE_DIR}/{}", descriptor.package_file)
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(BridgeError::Cancelled),
        res = fut => res,
    }
}

// ─── HTTP downloader ────────────────────────────────────────────────────

pub struct HttpRepositoryDownloader {
    client: reqwest::Client,
    max_package_size: u64,
}

impl HttpRepositoryDownloader {
    pub fn new(timeout: Duration, max_package_size: u64) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("extbridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            max_package_size,
        })
    }

    async fn get_bytes(&self, url: &str, limit: Option<u64>) -> Result<Vec<u8>, BridgeError> {
        tracing::debug!(url = %url, "fetching");
        let resp = self.client.get(url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BridgeError::Http(format!("{url} returned {status}")));
        }

        if let (Some(max), Some(len)) = (limit, resp.content_length()) {
            if len > max {
                return Err(BridgeError::Http(format!(
                    "{url} is too large: {len} bytes (max: {max} bytes)"
                )));
            }
        }

        let body = resp.bytes().await?;
        if let Some(max) = limit {
            if body.len() as u64 > max {
                return Err(BridgeError::Http(format!(
                    "{url} is too large: {} bytes (max: {max} bytes)",
                    body.len()
                )));
            }
        }
        Ok(body.to_vec())
    }

    async fn fetch_meta(&self, url: &str) -> Option<RepoMeta> {
        let meta_url = format!("{url}/{META_FILE}");
        let body = match self.get_bytes(&meta_url, None).await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(url = %meta_url, "no repository metadata: {e}");
                return None;
            }
        };
        match serde_json::from_slice::<RepoMetaFile>(&body) {
            Ok(file) => Some(file.meta),
            Err(e) => {
                tracing::warn!(url = %meta_url, "ignoring malformed repository metadata: {e}");
                None
            }
        }
    }

    /// First index file that downloads and parses. A malformed index is
    /// reported in preference to a missing one.
    async fn fetch_index(&self, url: &str) -> Result<Vec<ExtensionDescriptor>, BridgeError> {
        let mut error = None;
        for file in INDEX_FILES {
            let index_url = format!("{url}/{file}");
            let parsed: Result<Vec<ExtensionDescriptor>, BridgeError> =
                match self.get_bytes(&index_url, None).await {
                    Ok(body) => serde_json::from_slice(&body).map_err(BridgeError::from),
                    Err(e) => Err(e),
                };
            match parsed {
                Ok(extensions) => return Ok(extensions),
                Err(e) => {
                    tracing::debug!(url = %index_url, "index not usable: {e}");
                    if !matches!(error, Some(BridgeError::Serialization(_))) {
                        error = Some(e);
                    }
                }
            }
        }
        Err(error.unwrap_or_else(|| BridgeError::NotFound(format!("no index at {url}"))))
    }
}

#[async_trait]
impl RepositoryDownloader for HttpRepositoryDownloader {
    async fn fetch_repository(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteRepository, BridgeError> {
        cancellable(cancel, async {
            let meta = self.fetch_meta(url).await;
            let extensions = self.fetch_index(url).await?;

            let mut repo = RemoteRepository::new(repository_id(url), url);
            if let Some(meta) = meta {
                repo.name = meta.name;
                repo.website = meta.website;
                repo.fingerprint = meta.signing_key_fingerprint;
            }
            repo.extensions = extensions;
            repo.last_updated = Some(Utc::now());

            tracing::info!(
                repository = %url,
                extensions = repo.extensions.len(),
                "repository index fetched"
            );
            Ok(repo)
        })
        .await
    }

    async fn download_package(
        &self,
        repo_url: &str,
        descriptor: &ExtensionDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, BridgeError> {
        validate_package_file(&descriptor.package_file)?;
        let url = package_url(repo_url, descriptor);

        let bytes = cancellable(cancel, self.get_bytes(&url, Some(self.max_package_size))).await?;
        tracing::info!(
            package = %descriptor.package,
            version = %descriptor.version,
            size = bytes.len(),
            "package downloaded"
        );
        Ok(bytes)
    }
}
