//! Extension instances backed by the WASM sandbox.
//!
//! Calls are JSON in, JSON out. Every input carries the source id and a
//! snapshot of that source's stored preferences:
//!
//! | export        | input                                  | output            |
//! |---------------|----------------------------------------|-------------------|
//! | `sources`     | `{}`                                   | `[SourceInfo]`    |
//! | `popular`     | `{source_id, page, preferences}`       | `MangaList`       |
//! | `latest`      | `{source_id, page, preferences}`       | `MangaList`       |
//! | `search`      | `{source_id, page, query, preferences}`| `MangaList`       |
//! | `details`     | `{source_id, manga, preferences}`      | `Manga`           |
//! | `chapters`    | `{source_id, manga, preferences}`      | `[Chapter]`       |
//! | `pages`       | `{source_id, chapter, preferences}`    | `[Page]`          |
//! | `image_url`   | `{source_id, page, preferences}`       | `String`          |
//! | `image`       | `{source_id, url, preferences}`        | `{content_type, data}` (base64) |
//! | `preferences` | `{source_id, preferences}`             | `[KeyPreference]` |
//! | `shutdown`    | `{}`                                   | ignored           |
//!
//! `latest`, `image_url`, `image`, `preferences` and `shutdown` are optional.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use base64::Engine;
use extbridge_models::{
    Chapter, ImageResponse, KeyPreference, Manga, MangaList, Page, RepositoryEntry, SourceInfo,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, SandboxError};
use crate::preference_store::{PreferenceRegistry, PreferenceStore, PreferenceValue};
use crate::runtime::sandbox::{ExtensionSandbox, SandboxConfig};
use crate::runtime::{ExtensionInterop, InstanceLoader, SourceInterop};

// ─── Sandbox pool ───────────────────────────────────────────────────────

/// Sandboxes over one module, checked out one per call.
///
/// A call owns its sandbox until it returns, so calls from different
/// sources run side by side and an interrupt only ever reaches the call
/// that owns the sandbox. Sandboxes are instantiated on demand, up to
/// `SandboxConfig::pool_size`.
struct SandboxPool {
    module: Arc<[u8]>,
    config: SandboxConfig,
    name: String,
    size: u32,
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<ExtensionSandbox>>>,
    interrupts: Mutex<Vec<extism::CancelHandle>>,
}

impl SandboxPool {
    /// Instantiate the first sandbox; a module that fails here never
    /// produces a pool.
    async fn load(
        module: Vec<u8>,
        config: SandboxConfig,
        name: &str,
    ) -> Result<Self, SandboxError> {
        let size = config.pool_size.max(1) as u32;
        let pool = Self {
            module: module.into(),
            config,
            name: name.to_string(),
            size,
            permits: Arc::new(Semaphore::new(size as usize)),
            idle: Arc::new(Mutex::new(Vec::new())),
            interrupts: Mutex::new(Vec::new()),
        };
        let first = pool.instantiate().await?;
        checkin(&pool.idle, first);
        Ok(pool)
    }

    async fn instantiate(&self) -> Result<ExtensionSandbox, SandboxError> {
        let module = self.module.to_vec();
        let config = self.config.clone();
        let name = self.name.clone();
        let sandbox =
            tokio::task::spawn_blocking(move || ExtensionSandbox::load(module, config, &name))
                .await
                .map_err(|e| SandboxError::Load(e.to_string()))??;

        let mut interrupts = self.interrupts.lock().unwrap_or_else(PoisonError::into_inner);
        interrupts.push(sandbox.cancel_handle());
        tracing::debug!(extension = %self.name, instances = interrupts.len(), "sandbox instantiated");
        Ok(sandbox)
    }

    async fn call<I, O>(
        &self,
        function: &str,
        input: I,
        cancel: &CancellationToken,
    ) -> Result<O, SandboxError>
    where
        I: Serialize + Send + 'static,
        O: DeserializeOwned + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        // Waiting for a free sandbox is abandoned on cancel, so a caller
        // cancelled in the queue never runs at all.
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| SandboxError::Call(format!("{} is shut down", self.name)))?,
            _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
        };

        let idle_sandbox = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut sandbox = match idle_sandbox {
            Some(sandbox) => sandbox,
            None => self.instantiate().await?,
        };
        let interrupt = sandbox.cancel_handle();

        let idle = self.idle.clone();
        let function = function.to_string();
        let token = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            let result = if token.is_cancelled() {
                Err(SandboxError::Cancelled)
            } else {
                sandbox.call_json::<I, O>(&function, &input)
            };
            checkin(&idle, sandbox);
            drop(permit);
            result
        });

        tokio::select! {
            joined = task => joined.map_err(|e| SandboxError::Call(e.to_string()))?,
            _ = cancel.cancelled() => {
                if let Err(e) = interrupt.cancel() {
                    tracing::warn!(extension = %self.name, "failed to interrupt extension call: {e}");
                }
                Err(SandboxError::Cancelled)
            }
        }
    }

    /// Interrupt every call currently running in the pool.
    fn interrupt_all(&self) {
        let interrupts = self.interrupts.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in interrupts.iter() {
            if let Err(e) = handle.cancel() {
                tracing::warn!(extension = %self.name, "failed to interrupt extension call: {e}");
            }
        }
    }

    /// Wait for running calls, call `function` once in every sandbox, and
    /// refuse further calls.
    async fn close(&self, function: &str) -> Result<(), SandboxError> {
        let Ok(permits) = self.permits.clone().acquire_many_owned(self.size).await else {
            return Ok(());
        };
        self.permits.close();

        let sandboxes = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *idle)
        };
        let function = function.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let mut first_error = None;
            for mut sandbox in sandboxes {
                match sandbox.call(&function, b"{}") {
                    Ok(_) | Err(SandboxError::Unsupported(_)) => {}
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| SandboxError::Call(e.to_string()))?;

        drop(permits);
        result
    }
}

fn checkin(idle: &Mutex<Vec<ExtensionSandbox>>, sandbox: ExtensionSandbox) {
    idle.lock().unwrap_or_else(PoisonError::into_inner).push(sandbox);
}

// ─── Loader ─────────────────────────────────────────────────────────────

pub struct WasmLoader {
    config: SandboxConfig,
    preferences: Arc<PreferenceRegistry>,
}

impl WasmLoader {
    pub fn new(config: SandboxConfig, preferences: Arc<PreferenceRegistry>) -> Self {
        Self {
            config,
            preferences,
        }
    }
}

#[async_trait]
impl InstanceLoader for WasmLoader {
    async fn load(
        &self,
        entry: &RepositoryEntry,
        module_path: &Path,
    ) -> Result<Arc<dyn ExtensionInterop>, BridgeError> {
        let module = tokio::fs::read(module_path).await?;
        let pool = Arc::new(
            SandboxPool::load(module, self.config.clone(), &entry.extension.package).await?,
        );

        let infos: Vec<SourceInfo> = pool
            .call("sources", json!({}), &CancellationToken::new())
            .await?;
        if infos.is_empty() {
            return Err(SandboxError::InvalidOutput("extension declares no sources".into()).into());
        }

        let sources = infos
            .into_iter()
            .map(|info| {
                let store = self.preferences.store(&entry.extension.package, info.id);
                Arc::new(WasmSource {
                    info,
                    pool: pool.clone(),
                    store,
                }) as Arc<dyn SourceInterop>
            })
            .collect::<Vec<_>>();

        tracing::info!(
            package = %entry.extension.package,
            version = %entry.extension.version,
            sources = sources.len(),
            "extension module loaded"
        );

        Ok(Arc::new(WasmExtension {
            entry_id: entry.id().to_string(),
            name: entry.name.clone(),
            version: entry.extension.version.clone(),
            pool,
            sources,
        }))
    }
}

// ─── Extension ──────────────────────────────────────────────────────────

struct WasmExtension {
    entry_id: String,
    name: String,
    version: String,
    pool: Arc<SandboxPool>,
    sources: Vec<Arc<dyn SourceInterop>>,
}

#[async_trait]
impl ExtensionInterop for WasmExtension {
    fn entry_id(&self) -> &str {
        &self.entry_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn sources(&self) -> Vec<Arc<dyn SourceInterop>> {
        self.sources.clone()
    }

    fn interrupt(&self) {
        self.pool.interrupt_all();
    }

    /// Runs the optional `shutdown` export in every sandbox.
    async fn shutdown(&self) -> Result<(), BridgeError> {
        Ok(self.pool.close("shutdown").await?)
    }
}

// ─── Source ─────────────────────────────────────────────────────────────

struct WasmSource {
    info: SourceInfo,
    pool: Arc<SandboxPool>,
    store: Arc<PreferenceStore>,
}

#[derive(Deserialize)]
struct ImagePayload {
    content_type: String,
    data: String,
}

impl WasmSource {
    async fn call<O>(
        &self,
        function: &str,
        mut input: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<O, BridgeError>
    where
        O: DeserializeOwned + Send + 'static,
    {
        if let Some(obj) = input.as_object_mut() {
            obj.insert("source_id".into(), json!(self.info.id));
            let preferences = self.store.all().await?;
            obj.insert("preferences".into(), serde_json::to_value(preferences)?);
        }
        Ok(self.pool.call(function, input, cancel).await?)
    }
}

#[async_trait]
impl SourceInterop for WasmSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    async fn popular(&self, page: u32, cancel: &CancellationToken) -> Result<MangaList, BridgeError> {
        self.call("popular", json!({ "page": page }), cancel).await
    }

    async fn latest(&self, page: u32, cancel: &CancellationToken) -> Result<MangaList, BridgeError> {
        self.call("latest", json!({ "page": page }), cancel).await
    }

    async fn search(
        &self,
        query: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<MangaList, BridgeError> {
        self.call("search", json!({ "page": page, "query": query }), cancel)
            .await
    }

    async fn details(&self, manga: &Manga, cancel: &CancellationToken) -> Result<Manga, BridgeError> {
        self.call("details", json!({ "manga": manga }), cancel).await
    }

    async fn chapters(
        &self,
        manga: &Manga,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chapter>, BridgeError> {
        self.call("chapters", json!({ "manga": manga }), cancel).await
    }

    async fn pages(
        &self,
        chapter: &Chapter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Page>, BridgeError> {
        self.call("pages", json!({ "chapter": chapter }), cancel).await
    }

    async fn page_image(
        &self,
        page: &Page,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse, BridgeError> {
        let url = match page.image_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => url.to_string(),
            None => {
                self.call::<String>("image_url", json!({ "page": page }), cancel)
                    .await?
            }
        };
        self.download_url(&url, cancel).await
    }

    async fn download_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse, BridgeError> {
        let payload: ImagePayload = self.call("image", json!({ "url": url }), cancel).await?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(payload.data.as_bytes())
            .map_err(|e| SandboxError::InvalidOutput(format!("image data is not base64: {e}")))?;
        Ok(ImageResponse {
            content_type: payload.content_type,
            data,
        })
    }

    async fn preferences(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeyPreference>, BridgeError> {
        match self
            .call::<Vec<KeyPreference>>("preferences", json!({}), cancel)
            .await
        {
            Err(BridgeError::Sandbox(SandboxError::Unsupported(_))) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn set_preference(
        &self,
        key: &str,
        value: Option<PreferenceValue>,
    ) -> Result<(), BridgeError> {
        match value {
            Some(value) => self.store.set(key, value).await?,
            None => {
                self.store.remove(key).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::compiler::compile;
    use crate::runtime::gate::GatePhase;
    use crate::runtime::handle::ExtensionHandle;
    use crate::test_support::{
        fake_entry, module_bytes, module_with_bodies, EMPTY_BODY, SOURCE_EN, SPIN_BODY,
    };
    use std::time::{Duration, Instant};

    fn spin_config(pool_size: usize, call_timeout_secs: u64) -> SandboxConfig {
        SandboxConfig {
            fuel_limit: u64::MAX / 4,
            call_timeout_secs,
            pool_size,
            ..SandboxConfig::default()
        }
    }

    fn spin_module() -> Vec<u8> {
        module_with_bodies(&[("spin", SPIN_BODY), ("noop", EMPTY_BODY)], &[])
    }

    async fn spin_pool(pool_size: usize, call_timeout_secs: u64) -> Arc<SandboxPool> {
        Arc::new(
            SandboxPool::load(spin_module(), spin_config(pool_size, call_timeout_secs), "spin")
                .await
                .unwrap(),
        )
    }

    async fn timed_spin(
        pool: Arc<SandboxPool>,
        cancel: CancellationToken,
    ) -> (Result<serde_json::Value, SandboxError>, Duration) {
        let started = Instant::now();
        let result = pool.call("spin", json!({}), &cancel).await;
        (result, started.elapsed())
    }

    /// Builds instances whose `popular` export spins forever.
    struct SpinLoader {
        config: SandboxConfig,
        preferences: Arc<PreferenceRegistry>,
    }

    #[async_trait]
    impl InstanceLoader for SpinLoader {
        async fn load(
            &self,
            entry: &RepositoryEntry,
            module_path: &Path,
        ) -> Result<Arc<dyn ExtensionInterop>, BridgeError> {
            let module = tokio::fs::read(module_path).await?;
            let pool = Arc::new(SandboxPool::load(module, self.config.clone(), "spin").await?);
            let source = Arc::new(WasmSource {
                info: SourceInfo {
                    id: SOURCE_EN,
                    name: "Spin".into(),
                    language: "en".into(),
                    ..Default::default()
                },
                pool: pool.clone(),
                store: self.preferences.store("a.b.test", SOURCE_EN),
            }) as Arc<dyn SourceInterop>;
            Ok(Arc::new(WasmExtension {
                entry_id: entry.id().to_string(),
                name: entry.name.clone(),
                version: entry.extension.version.clone(),
                pool,
                sources: vec![source],
            }))
        }
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module.wasm");
        tokio::fs::write(&path, b"not a module").await.unwrap();

        let loader = WasmLoader::new(
            SandboxConfig::default(),
            Arc::new(PreferenceRegistry::new(dir.path())),
        );
        let err = loader.load(&fake_entry("1.0"), &path).await.err().unwrap();
        assert!(matches!(err, BridgeError::Sandbox(SandboxError::Load(_))));
    }

    #[tokio::test]
    async fn test_load_missing_module_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = WasmLoader::new(
            SandboxConfig::default(),
            Arc::new(PreferenceRegistry::new(dir.path())),
        );
        let err = loader
            .load(&fake_entry("1.0"), &dir.path().join("missing.wasm"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Io(_)));
    }

    #[tokio::test]
    async fn test_sources_export_must_return_json() {
        // Exports exist but return nothing, so `sources` yields no JSON.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module.wasm");
        let module = compile(
            &module_bytes(crate::pipeline::compiler::REQUIRED_EXPORTS, &[]),
            1,
        )
        .unwrap();
        tokio::fs::write(&path, module).await.unwrap();

        let loader = WasmLoader::new(
            SandboxConfig::default(),
            Arc::new(PreferenceRegistry::new(dir.path())),
        );
        assert!(loader.load(&fake_entry("1.0"), &path).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_waiter_leaves_running_call_alone() {
        let pool = spin_pool(1, 3).await;

        let running = tokio::spawn(timed_spin(pool.clone(), CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let waiter_cancel = CancellationToken::new();
        let waiter = tokio::spawn(timed_spin(pool.clone(), waiter_cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        waiter_cancel.cancel();

        let (waiter_result, waited) = waiter.await.unwrap();
        assert!(matches!(waiter_result, Err(SandboxError::Cancelled)));
        assert!(waited < Duration::from_secs(1));

        // The running call is only stopped by its own timeout.
        let (running_result, ran) = running.await.unwrap();
        assert!(running_result.is_err());
        assert!(ran >= Duration::from_millis(2500), "interrupted after {ran:?}");

        // The cancelled waiter never ran, so the sandbox is free at once.
        let started = Instant::now();
        let _ = pool
            .call::<_, serde_json::Value>("noop", json!({}), &CancellationToken::new())
            .await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_interrupts_only_own_call() {
        let pool = spin_pool(2, 3).await;

        let kept = tokio::spawn(timed_spin(pool.clone(), CancellationToken::new()));
        let cancel = CancellationToken::new();
        let cancelled = tokio::spawn(timed_spin(pool.clone(), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();

        let (result, elapsed) = cancelled.await.unwrap();
        assert!(matches!(result, Err(SandboxError::Cancelled)));
        assert!(elapsed < Duration::from_secs(1));

        let (result, ran) = kept.await.unwrap();
        assert!(result.is_err());
        assert!(ran >= Duration::from_millis(2500), "interrupted after {ran:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_calls_run_in_parallel() {
        let pool = spin_pool(2, 2).await;

        let started = Instant::now();
        let (a, b) = tokio::join!(
            timed_spin(pool.clone(), CancellationToken::new()),
            timed_spin(pool.clone(), CancellationToken::new()),
        );
        assert!(a.0.is_err() && b.0.is_err());
        // Serialized, the two timeouts would add up to four seconds.
        assert!(started.elapsed() < Duration::from_millis(3500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_closed_pool_refuses_calls() {
        let pool = spin_pool(2, 2).await;
        pool.close("shutdown").await.unwrap();

        let err = pool
            .call::<_, serde_json::Value>("noop", json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Call(_)));
        // Closing twice is harmless.
        pool.close("shutdown").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_interrupts_stuck_call_after_drain_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module.wasm");
        let module = module_with_bodies(&[("popular", SPIN_BODY)], &[]);
        tokio::fs::write(&path, module).await.unwrap();

        let loader = Arc::new(SpinLoader {
            config: spin_config(2, 30),
            preferences: Arc::new(PreferenceRegistry::new(dir.path())),
        });
        let handle = ExtensionHandle::new("a.b.test", loader, Duration::from_millis(300));
        handle
            .swap_to(&fake_entry("1.0"), &path, &CancellationToken::new())
            .await
            .unwrap();

        let stuck = {
            let source = handle.source(SOURCE_EN);
            tokio::spawn(async move { source.popular(1, &CancellationToken::new()).await })
        };
        while handle.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        handle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(handle.phase(), GatePhase::Terminated);

        let result = tokio::time::timeout(Duration::from_secs(5), stuck)
            .await
            .expect("stuck call was not interrupted")
            .unwrap();
        assert!(result.is_err());
    }
}
