//! Capability interfaces over loaded extension instances, plus the gate and
//! handle that let one instance be replaced underneath concurrent callers.

pub mod gate;
pub mod handle;
pub mod sandbox;
pub mod wasm;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use extbridge_models::{
    Chapter, ImageResponse, KeyPreference, Manga, MangaList, Page, RepositoryEntry, SourceInfo,
    UniquePreference,
};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::preference_store::PreferenceValue;
use crate::preferences;

/// One source exposed by a loaded extension.
#[async_trait]
pub trait SourceInterop: Send + Sync {
    fn info(&self) -> &SourceInfo;

    async fn popular(&self, page: u32, cancel: &CancellationToken)
        -> Result<MangaList, BridgeError>;

    async fn latest(&self, page: u32, cancel: &CancellationToken)
        -> Result<MangaList, BridgeError>;

    async fn search(
        &self,
        query: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<MangaList, BridgeError>;

    async fn details(&self, manga: &Manga, cancel: &CancellationToken)
        -> Result<Manga, BridgeError>;

    async fn chapters(
        &self,
        manga: &Manga,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chapter>, BridgeError>;

    async fn pages(
        &self,
        chapter: &Chapter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Page>, BridgeError>;

    async fn page_image(
        &self,
        page: &Page,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse, BridgeError>;

    /// Fetch an arbitrary image URL through the source (cover art, banners).
    async fn download_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse, BridgeError>;

    /// Declared preferences with their stored values.
    async fn preferences(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeyPreference>, BridgeError>;

    /// Store a value; `None` removes the key.
    async fn set_preference(
        &self,
        key: &str,
        value: Option<PreferenceValue>,
    ) -> Result<(), BridgeError>;
}

/// A loaded extension instance.
#[async_trait]
pub trait ExtensionInterop: Send + Sync {
    /// Id of the repository entry this instance was built from.
    fn entry_id(&self) -> &str;

    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn sources(&self) -> Vec<Arc<dyn SourceInterop>>;

    fn source(&self, source_id: i64) -> Option<Arc<dyn SourceInterop>> {
        self.sources()
            .into_iter()
            .find(|s| s.info().id == source_id)
    }

    /// One entry per distinct preference key across every source.
    async fn load_preferences(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<UniquePreference>, BridgeError> {
        preferences::load_unique(&self.sources(), cancel).await
    }

    /// Write the preference's value to every source it covers.
    async fn save_preferences(
        &self,
        preference: &UniquePreference,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        preferences::save_unique(&self.sources(), preference, cancel).await
    }

    /// Interrupt calls still running against this instance.
    fn interrupt(&self) {}

    async fn shutdown(&self) -> Result<(), BridgeError>;
}

/// Builds live instances from compiled modules.
#[async_trait]
pub trait InstanceLoader: Send + Sync {
    async fn load(
        &self,
        entry: &RepositoryEntry,
        module_path: &Path,
    ) -> Result<Arc<dyn ExtensionInterop>, BridgeError>;
}
