//! Stable handles over swappable extension instances.
//!
//! An [`ExtensionHandle`] keeps its identity for the lifetime of a package
//! while the instance behind it is loaded, swapped, unloaded, or shut down.
//! Every call enters the handle's gate, resolves the current instance, and
//! delegates; [`SourceHandle`]s resolve their source by id at call time and
//! share the parent's gate.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use extbridge_models::{
    Chapter, ImageResponse, KeyPreference, Manga, MangaList, Page, RepositoryEntry, SourceInfo,
    UniquePreference,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, GateError, SwapError};
use crate::preference_store::PreferenceValue;
use crate::runtime::gate::{DrainOutcome, Gate, GatePhase};
use crate::runtime::{ExtensionInterop, InstanceLoader, SourceInterop};

struct HandleInner {
    package: String,
    gate: Gate,
    current: RwLock<Option<Arc<dyn ExtensionInterop>>>,
    /// Serializes swap, unload and shutdown on this handle.
    swap_lock: AsyncMutex<()>,
    loader: Arc<dyn InstanceLoader>,
    drain_timeout: Duration,
}

#[derive(Clone)]
pub struct ExtensionHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ExtensionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHandle")
            .field("package", &self.inner.package)
            .field("phase", &self.phase())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl ExtensionHandle {
    /// A handle with nothing loaded yet.
    pub fn new(
        package: impl Into<String>,
        loader: Arc<dyn InstanceLoader>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                package: package.into(),
                gate: Gate::new(GatePhase::Unloaded),
                current: RwLock::new(None),
                swap_lock: AsyncMutex::new(()),
                loader,
                drain_timeout,
            }),
        }
    }

    pub fn package(&self) -> &str {
        &self.inner.package
    }

    pub fn phase(&self) -> GatePhase {
        self.inner.gate.phase()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.gate.in_flight()
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    /// Entry id of the live instance, if any.
    pub fn loaded_entry_id(&self) -> Option<String> {
        self.current().map(|i| i.entry_id().to_string())
    }

    /// Whether two handles share one gate and instance slot.
    pub fn same_handle(&self, other: &ExtensionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn current(&self) -> Option<Arc<dyn ExtensionInterop>> {
        self.inner
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn publish(&self, instance: Option<Arc<dyn ExtensionInterop>>) -> Option<Arc<dyn ExtensionInterop>> {
        let mut slot = self
            .inner
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, instance)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Replace the live instance with one built from `entry`.
    ///
    /// Calls already running finish against the old instance; calls arriving
    /// meanwhile wait and then run against the new one. If `cancel` fires
    /// while draining, or the replacement cannot be built, the gate reopens
    /// over the old instance and the swap reports an error.
    pub async fn swap_to(
        &self,
        entry: &RepositoryEntry,
        module_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), SwapError> {
        let _swap = self.inner.swap_lock.lock().await;
        let gate = &self.inner.gate;

        let previous = gate.close().map_err(|_| SwapError::Terminated)?;

        match gate.drain(None, cancel).await {
            DrainOutcome::Drained => {}
            DrainOutcome::Cancelled | DrainOutcome::TimedOut => {
                gate.set_phase(previous);
                return Err(SwapError::Cancelled);
            }
        }
        gate.set_phase(GatePhase::Swapping);

        let replacement = match self.inner.loader.load(entry, module_path).await {
            Ok(instance) => instance,
            Err(e) => {
                gate.set_phase(previous);
                tracing::error!(
                    package = %self.inner.package,
                    entry = %entry.id(),
                    "swap failed, keeping previous instance: {e}"
                );
                return Err(SwapError::Construct(e.to_string()));
            }
        };

        if let Some(old) = self.current() {
            self.shut_down_instance(old, false).await;
        }

        let version = replacement.version().to_string();
        self.publish(Some(replacement));
        gate.set_phase(GatePhase::Open);

        tracing::info!(
            package = %self.inner.package,
            entry = %entry.id(),
            version = %version,
            "extension instance swapped in"
        );
        Ok(())
    }

    /// Drop the live instance but keep the handle usable for a later swap.
    pub async fn unload(&self) {
        self.retire(GatePhase::Unloaded).await;
    }

    /// Close the handle for good.
    pub async fn shutdown(&self) {
        self.retire(GatePhase::Terminated).await;
    }

    async fn retire(&self, target: GatePhase) {
        let _swap = self.inner.swap_lock.lock().await;
        let gate = &self.inner.gate;

        if gate.close().is_err() {
            return;
        }

        let outcome = gate
            .drain(Some(self.inner.drain_timeout), &CancellationToken::new())
            .await;
        if outcome == DrainOutcome::TimedOut {
            tracing::warn!(
                package = %self.inner.package,
                in_flight = gate.in_flight(),
                timeout_secs = self.inner.drain_timeout.as_secs_f64(),
                "drain timed out, shutting down with calls still running"
            );
        }

        if let Some(old) = self.publish(None) {
            self.shut_down_instance(old, outcome == DrainOutcome::TimedOut)
                .await;
        }

        gate.set_phase(target);
        tracing::info!(package = %self.inner.package, phase = ?target, "extension instance retired");
    }

    /// Shut `old` down, waiting at most the drain timeout. Calls the drain
    /// gave up on are interrupted first when `interrupt` is set.
    async fn shut_down_instance(&self, old: Arc<dyn ExtensionInterop>, interrupt: bool) {
        if interrupt {
            old.interrupt();
        }
        match tokio::time::timeout(self.inner.drain_timeout, old.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                package = %self.inner.package,
                entry = %old.entry_id(),
                "instance failed to shut down cleanly: {e}"
            ),
            Err(_) => tracing::warn!(
                package = %self.inner.package,
                entry = %old.entry_id(),
                timeout_secs = self.inner.drain_timeout.as_secs_f64(),
                "instance shutdown timed out"
            ),
        }
    }

    // ─── Gated calls ────────────────────────────────────────────────────

    async fn with_instance<T, F, Fut>(&self, cancel: &CancellationToken, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce(Arc<dyn ExtensionInterop>) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let _pass = self.inner.gate.enter(cancel).await?;
        let instance = self.current().ok_or(GateError::Unloaded)?;
        f(instance).await
    }

    async fn with_source<T, F, Fut>(
        &self,
        source_id: i64,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, BridgeError>
    where
        F: FnOnce(Arc<dyn SourceInterop>) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        self.with_instance(cancel, |instance| async move {
            let source = instance
                .source(source_id)
                .ok_or_else(|| BridgeError::NotFound(format!("source {source_id}")))?;
            f(source).await
        })
        .await
    }

    pub async fn name(&self, cancel: &CancellationToken) -> Result<String, BridgeError> {
        self.with_instance(cancel, |i| async move { Ok(i.name().to_string()) })
            .await
    }

    pub async fn version(&self, cancel: &CancellationToken) -> Result<String, BridgeError> {
        self.with_instance(cancel, |i| async move { Ok(i.version().to_string()) })
            .await
    }

    /// Handles for every source the live instance declares.
    pub async fn sources(&self, cancel: &CancellationToken) -> Result<Vec<SourceHandle>, BridgeError> {
        let ids = self
            .with_instance(cancel, |i| async move {
                Ok(i.sources().iter().map(|s| s.info().id).collect::<Vec<_>>())
            })
            .await?;
        Ok(ids.into_iter().map(|id| self.source(id)).collect())
    }

    /// Handle for one source; resolved on every call, so it survives swaps.
    pub fn source(&self, source_id: i64) -> SourceHandle {
        SourceHandle {
            handle: self.clone(),
            source_id,
        }
    }

    pub async fn load_preferences(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<UniquePreference>, BridgeError> {
        self.with_instance(cancel, |i| async move { i.load_preferences(cancel).await })
            .await
    }

    pub async fn save_preferences(
        &self,
        preference: &UniquePreference,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        self.with_instance(cancel, |i| async move {
            i.save_preferences(preference, cancel).await
        })
        .await
    }
}

// ─── Source handle ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SourceHandle {
    handle: ExtensionHandle,
    source_id: i64,
}

impl SourceHandle {
    pub fn id(&self) -> i64 {
        self.source_id
    }

    pub fn extension(&self) -> &ExtensionHandle {
        &self.handle
    }

    pub async fn info(&self, cancel: &CancellationToken) -> Result<SourceInfo, BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move { Ok(s.info().clone()) })
            .await
    }

    pub async fn popular(&self, page: u32, cancel: &CancellationToken) -> Result<MangaList, BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move { s.popular(page, cancel).await })
            .await
    }

    pub async fn latest(&self, page: u32, cancel: &CancellationToken) -> Result<MangaList, BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move { s.latest(page, cancel).await })
            .await
    }

    pub async fn search(
        &self,
        query: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<MangaList, BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move {
                s.search(query, page, cancel).await
            })
            .await
    }

    pub async fn details(&self, manga: &Manga, cancel: &CancellationToken) -> Result<Manga, BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move { s.details(manga, cancel).await })
            .await
    }

    pub async fn chapters(
        &self,
        manga: &Manga,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chapter>, BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move { s.chapters(manga, cancel).await })
            .await
    }

    pub async fn pages(
        &self,
        chapter: &Chapter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Page>, BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move { s.pages(chapter, cancel).await })
            .await
    }

    pub async fn page_image(
        &self,
        page: &Page,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse, BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move { s.page_image(page, cancel).await })
            .await
    }

    pub async fn download_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse, BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move { s.download_url(url, cancel).await })
            .await
    }

    pub async fn preferences(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeyPreference>, BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move { s.preferences(cancel).await })
            .await
    }

    pub async fn set_preference(
        &self,
        key: &str,
        value: Option<PreferenceValue>,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        self.handle
            .with_source(self.source_id, cancel, |s| async move {
                s.set_preference(key, value).await
            })
            .await
    }
}
