//! Fixtures shared by unit tests: hand-assembled packages and an in-memory
//! extension implementation with controllable latency and failures.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use extbridge_models::{
    ArtifactHash, Chapter, ExtensionDescriptor, ImageResponse, KeyPreference, Manga, MangaList,
    Page, Preference, RepositoryEntry, SourceInfo,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::identity::sha256_hex;
use crate::pipeline::compiler::REQUIRED_EXPORTS;
use crate::pipeline::converter::{push_custom_section, push_section, write_leb128};
use crate::pipeline::manifest::MANIFEST_SECTION;
use crate::preference_store::{PreferenceRegistry, PreferenceStore, PreferenceValue};
use crate::runtime::{ExtensionInterop, InstanceLoader, SourceInterop};

pub const SOURCE_EN: i64 = 1001;
pub const SOURCE_FR: i64 = 1002;

/// Route `tracing` output to the test writer. Honours `RUST_LOG`; safe to
/// call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ─── Packages ───────────────────────────────────────────────────────────

/// Function body that never returns: `loop br 0 end`.
pub const SPIN_BODY: &[u8] = &[0x03, 0x40, 0x0C, 0x00, 0x0B, 0x0B];

/// Function body that returns at once.
pub const EMPTY_BODY: &[u8] = &[0x0B];

/// A valid core module exporting one empty `() -> ()` function per name,
/// followed by the given custom sections.
pub fn module_bytes(exports: &[&str], custom: &[(&str, &[u8])]) -> Vec<u8> {
    let functions: Vec<(&str, &[u8])> = exports.iter().map(|name| (*name, EMPTY_BODY)).collect();
    module_with_bodies(&functions, custom)
}

/// A valid core module exporting one `() -> ()` function per entry, each
/// with the given body (instructions after the empty locals vector).
pub fn module_with_bodies(functions: &[(&str, &[u8])], custom: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];
    let count = functions.len() as u32;

    push_section(&mut out, 1, &[0x01, 0x60, 0x00, 0x00]);

    let mut declarations = Vec::new();
    write_leb128(&mut declarations, count);
    declarations.extend(std::iter::repeat(0x00).take(functions.len()));
    push_section(&mut out, 3, &declarations);

    let mut export_section = Vec::new();
    write_leb128(&mut export_section, count);
    for (idx, (name, _)) in functions.iter().enumerate() {
        write_leb128(&mut export_section, name.len() as u32);
        export_section.extend_from_slice(name.as_bytes());
        export_section.push(0x00);
        write_leb128(&mut export_section, idx as u32);
    }
    push_section(&mut out, 7, &export_section);

    let mut code = Vec::new();
    write_leb128(&mut code, count);
    for (_, body) in functions {
        write_leb128(&mut code, body.len() as u32 + 1);
        code.push(0x00);
        code.extend_from_slice(body);
    }
    push_section(&mut out, 10, &code);

    for (name, data) in custom {
        push_custom_section(&mut out, name, data);
    }
    out
}

pub fn manifest_toml(package: &str, version: &str, version_code: i64) -> String {
    format!(
        r#"[extension]
name = "Tachiyomi: Test"
package = "{package}"
version = "{version}"
version_code = {version_code}
lib_version = "1.4"
entry_point = ".TestSource"
"#
    )
}

/// A complete, installable package.
pub fn package_bytes(package: &str, version: &str, version_code: i64) -> Vec<u8> {
    let manifest = manifest_toml(package, version, version_code);
    let mut exports: Vec<&str> = REQUIRED_EXPORTS.to_vec();
    exports.extend(["latest", "image", "preferences"]);
    module_bytes(&exports, &[(MANIFEST_SECTION, manifest.as_bytes())])
}

pub fn skeleton_entry(id: &str) -> RepositoryEntry {
    RepositoryEntry {
        repository_id: None,
        is_local: true,
        name: String::new(),
        entry_point: String::new(),
        extension: ExtensionDescriptor::default(),
        download_url: None,
        downloaded_at: Utc::now(),
        package: ArtifactHash::new("package.wasm", id, 1),
        archive: None,
        module: None,
    }
}

/// An entry of `a.b.test` whose id is derived from `version`.
pub fn fake_entry(version: &str) -> RepositoryEntry {
    let mut entry = skeleton_entry(&sha256_hex(version.as_bytes()));
    entry.name = "Test".into();
    entry.extension.name = "Test".into();
    entry.extension.package = "a.b.test".into();
    entry.extension.version = version.into();
    entry
}

// ─── Fake extension ─────────────────────────────────────────────────────

/// Knobs and counters shared by a fake loader and everything it builds.
#[derive(Debug, Default)]
pub struct TestBehaviour {
    call_delay: Mutex<Duration>,
    fail_next_load: AtomicBool,
    fail_shutdowns: AtomicBool,
    loads: AtomicUsize,
    shutdowns: AtomicUsize,
    interrupts: AtomicUsize,
}

impl TestBehaviour {
    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = delay;
    }

    fn call_delay(&self) -> Duration {
        *self.call_delay.lock().unwrap()
    }

    pub fn fail_next_load(&self) {
        self.fail_next_load.store(true, Ordering::SeqCst);
    }

    pub fn fail_shutdowns(&self) {
        self.fail_shutdowns.store(true, Ordering::SeqCst);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

struct FakeSource {
    info: SourceInfo,
    version: String,
    store: Arc<PreferenceStore>,
    behaviour: Arc<TestBehaviour>,
}

impl FakeSource {
    async fn work(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        let delay = self.behaviour.call_delay();
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn listing(&self, label: &str) -> MangaList {
        MangaList {
            mangas: vec![Manga {
                url: format!("/manga/{label}"),
                title: format!("{}:{label}", self.version),
                ..Default::default()
            }],
            has_next_page: false,
        }
    }

    fn quality_key(&self) -> String {
        format!("quality_{}", self.info.language)
    }
}

#[async_trait]
impl SourceInterop for FakeSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    async fn popular(&self, _page: u32, cancel: &CancellationToken) -> Result<MangaList, BridgeError> {
        self.work(cancel).await?;
        Ok(self.listing("popular"))
    }

    async fn latest(&self, _page: u32, cancel: &CancellationToken) -> Result<MangaList, BridgeError> {
        self.work(cancel).await?;
        Ok(self.listing("latest"))
    }

    async fn search(
        &self,
        query: &str,
        _page: u32,
        cancel: &CancellationToken,
    ) -> Result<MangaList, BridgeError> {
        self.work(cancel).await?;
        Ok(self.listing(query))
    }

    async fn details(&self, manga: &Manga, cancel: &CancellationToken) -> Result<Manga, BridgeError> {
        self.work(cancel).await?;
        Ok(Manga {
            description: Some(self.version.clone()),
            initialized: true,
            ..manga.clone()
        })
    }

    async fn chapters(
        &self,
        manga: &Manga,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chapter>, BridgeError> {
        self.work(cancel).await?;
        Ok((1..=2)
            .map(|n| Chapter {
                url: format!("{}/{n}", manga.url),
                name: format!("Chapter {n}"),
                chapter_number: n as f32,
                ..Default::default()
            })
            .collect())
    }

    async fn pages(
        &self,
        chapter: &Chapter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Page>, BridgeError> {
        self.work(cancel).await?;
        Ok((0..3)
            .map(|index| Page {
                index,
                url: chapter.url.clone(),
                image_url: Some(format!("https://img.test{}/{index}.png", chapter.url)),
            })
            .collect())
    }

    async fn page_image(
        &self,
        page: &Page,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse, BridgeError> {
        let url = page.image_url.clone().unwrap_or_default();
        self.download_url(&url, cancel).await
    }

    async fn download_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse, BridgeError> {
        self.work(cancel).await?;
        Ok(ImageResponse {
            content_type: "image/png".into(),
            data: url.as_bytes().to_vec(),
        })
    }

    async fn preferences(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeyPreference>, BridgeError> {
        self.work(cancel).await?;
        let key = self.quality_key();
        let current = self.store.get(&key).await?.map(|v| v.as_text());
        Ok(vec![KeyPreference {
            key,
            preference: Preference {
                kind: "ListPreference".into(),
                title: Some("Image quality".into()),
                default_value: Some("high".into()),
                entries: vec!["High".into(), "Low".into()],
                entry_values: vec!["high".into(), "low".into()],
                current_value: current.or_else(|| Some("high".into())),
                visible: true,
                ..Default::default()
            },
        }])
    }

    async fn set_preference(
        &self,
        key: &str,
        value: Option<PreferenceValue>,
    ) -> Result<(), BridgeError> {
        match value {
            Some(v) => self.store.set(key, v).await?,
            None => {
                self.store.remove(key).await?;
            }
        }
        Ok(())
    }
}

pub fn fake_sources(
    package: &str,
    version: &str,
    registry: &PreferenceRegistry,
    behaviour: &Arc<TestBehaviour>,
) -> Vec<Arc<dyn SourceInterop>> {
    [(SOURCE_EN, "en"), (SOURCE_FR, "fr")]
        .into_iter()
        .map(|(id, lang)| {
            Arc::new(FakeSource {
                info: SourceInfo {
                    id,
                    name: "Test".into(),
                    language: lang.into(),
                    base_url: "https://test.example".into(),
                    version_id: 1,
                    supports_latest: true,
                    configurable: true,
                },
                version: version.to_string(),
                store: registry.store(package, id),
                behaviour: behaviour.clone(),
            }) as Arc<dyn SourceInterop>
        })
        .collect()
}

struct FakeExtension {
    entry_id: String,
    name: String,
    version: String,
    sources: Vec<Arc<dyn SourceInterop>>,
    behaviour: Arc<TestBehaviour>,
}

#[async_trait]
impl ExtensionInterop for FakeExtension {
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
        self.behaviour.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    async fn shutdown(&self) -> Result<(), BridgeError> {
        self.behaviour.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.behaviour.fail_shutdowns.load(Ordering::SeqCst) {
            return Err(BridgeError::NotFound("instance already gone".into()));
        }
        Ok(())
    }
}

/// Loader producing [`FakeExtension`]s versioned after the entry.
pub struct FakeLoader {
    pub behaviour: Arc<TestBehaviour>,
    registry: Arc<PreferenceRegistry>,
    _prefs_dir: Option<TempDir>,
}

impl FakeLoader {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PreferenceRegistry::new(dir.path()));
        Self {
            behaviour: Arc::new(TestBehaviour::default()),
            registry,
            _prefs_dir: Some(dir),
        }
    }

    pub fn with_registry(registry: Arc<PreferenceRegistry>) -> Self {
        Self {
            behaviour: Arc::new(TestBehaviour::default()),
            registry,
            _prefs_dir: None,
        }
    }
}

#[async_trait]
impl InstanceLoader for FakeLoader {
    async fn load(
        &self,
        entry: &RepositoryEntry,
        _module_path: &Path,
    ) -> Result<Arc<dyn ExtensionInterop>, BridgeError> {
        self.behaviour.loads.fetch_add(1, Ordering::SeqCst);
        if self.behaviour.fail_next_load.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::NotFound("module failed to initialize".into()));
        }

        let package = &entry.extension.package;
        let version = &entry.extension.version;
        Ok(Arc::new(FakeExtension {
            entry_id: entry.id().to_string(),
            name: entry.extension.name.clone(),
            version: version.clone(),
            sources: fake_sources(package, version, &self.registry, &self.behaviour),
            behaviour: self.behaviour.clone(),
        }))
    }
}
