//! Version store: every installed version of every extension package.
//!
//! Groups are keyed by package id and persisted to `extensions.json`. Each
//! package gets one [`ExtensionHandle`] for the life of the store; activating
//! another version swaps the instance behind that handle instead of handing
//! out a new one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use extbridge_models::{
    ArtifactHash, ExtensionDescriptor, RemoteRepository, RepositoryEntry, RepositoryGroup,
    SourceDescriptor, SourceInfo,
};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::downloader::{package_url, RepositoryDownloader};
use crate::error::{BridgeError, ConversionError};
use crate::folder::{write_atomic, WorkingFolder, PACKAGE_FILE};
use crate::identity::sha256_hex;
use crate::pipeline::Pipeline;
use crate::preference_store::PreferenceRegistry;
use crate::runtime::handle::ExtensionHandle;
use crate::runtime::InstanceLoader;

/// Language reported for extensions whose sources span several languages.
const MULTI_LANGUAGE: &str = "all";

fn check_cancelled(cancel: &CancellationToken) -> Result<(), BridgeError> {
    if cancel.is_cancelled() {
        return Err(BridgeError::Cancelled);
    }
    Ok(())
}

/// Replace declared sources with the ones the module reports and derive the
/// extension language from them.
fn reconcile_sources(descriptor: &mut ExtensionDescriptor, reported: &[SourceInfo]) {
    if reported.is_empty() {
        return;
    }
    descriptor.sources = reported.iter().map(SourceDescriptor::from).collect();

    let languages: BTreeSet<&str> = reported.iter().map(|s| s.language.as_str()).collect();
    descriptor.language = match languages.len() {
        1 => languages.into_iter().next().unwrap_or(MULTI_LANGUAGE).to_string(),
        _ => MULTI_LANGUAGE.to_string(),
    };
}

pub struct ExtensionManager {
    folder: WorkingFolder,
    pipeline: Pipeline,
    loader: Arc<dyn InstanceLoader>,
    downloader: Arc<dyn RepositoryDownloader>,
    preferences: Arc<PreferenceRegistry>,
    metadata_path: PathBuf,
    drain_timeout: Duration,
    groups: RwLock<BTreeMap<String, RepositoryGroup>>,
    handles: Mutex<HashMap<String, ExtensionHandle>>,
    /// Serializes installs, activations and removals per package.
    group_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ExtensionManager {
    /// Load `extensions.json` and prepare the artifact tree.
    pub async fn open(
        config: &BridgeConfig,
        pipeline: Pipeline,
        loader: Arc<dyn InstanceLoader>,
        downloader: Arc<dyn RepositoryDownloader>,
        preferences: Arc<PreferenceRegistry>,
    ) -> Result<Self, BridgeError> {
        let folder = WorkingFolder::new(config);
        folder.ensure().await?;

        let metadata_path = config.extensions_file();
        let groups: Vec<RepositoryGroup> = match tokio::fs::read(&metadata_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            path = %metadata_path.display(),
            extensions = groups.len(),
            toolchain = pipeline.toolchain_version(),
            "extension store opened"
        );

        Ok(Self {
            folder,
            pipeline,
            loader,
            downloader,
            preferences,
            metadata_path,
            drain_timeout: config.drain_timeout,
            groups: RwLock::new(groups.into_iter().map(|g| (g.package.clone(), g)).collect()),
            handles: Mutex::new(HashMap::new()),
            group_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    // ─── Bookkeeping ────────────────────────────────────────────────────

    async fn save(&self, groups: &BTreeMap<String, RepositoryGroup>) -> Result<(), BridgeError> {
        let list: Vec<&RepositoryGroup> = groups.values().collect();
        let json = serde_json::to_vec_pretty(&list)?;
        if let Some(parent) = self.metadata_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&self.metadata_path, &json).await?;
        Ok(())
    }

    fn group_lock(&self, package: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.group_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(package.to_string()).or_default().clone()
    }

    /// Drop the lock of a removed package unless another task is waiting on it.
    /// `held` is the caller's own clone.
    fn forget_group_lock(&self, package: &str, held: &Arc<AsyncMutex<()>>) {
        let mut locks = self.group_locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks
            .get(package)
            .is_some_and(|lock| Arc::ptr_eq(lock, held) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(package);
        }
    }

    fn handle_for(&self, package: &str) -> ExtensionHandle {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .entry(package.to_string())
            .or_insert_with(|| {
                ExtensionHandle::new(package, self.loader.clone(), self.drain_timeout)
            })
            .clone()
    }

    fn existing_handle(&self, package: &str) -> Option<ExtensionHandle> {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.get(package).cloned()
    }

    fn take_handle(&self, package: &str) -> Option<ExtensionHandle> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.remove(package)
    }

    async fn group_containing(&self, entry_id: &str) -> Option<RepositoryGroup> {
        let groups = self.groups.read().await;
        groups
            .values()
            .find(|g| g.find_entry(entry_id).is_some())
            .cloned()
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub async fn list_extensions(&self) -> Vec<RepositoryGroup> {
        self.groups.read().await.values().cloned().collect()
    }

    pub async fn find_extension(&self, package: &str) -> Option<RepositoryGroup> {
        self.groups.read().await.get(package).cloned()
    }

    pub fn is_loaded(&self, package: &str) -> bool {
        self.existing_handle(package)
            .is_some_and(|h| h.is_loaded())
    }

    // ─── Building entries ───────────────────────────────────────────────

    fn new_entry(&self, id: &str) -> RepositoryEntry {
        RepositoryEntry {
            repository_id: None,
            is_local: true,
            name: String::new(),
            entry_point: String::new(),
            extension: ExtensionDescriptor::default(),
            download_url: None,
            downloaded_at: Utc::now(),
            package: ArtifactHash::new(PACKAGE_FILE, id, self.pipeline.toolchain_version()),
            archive: None,
            module: None,
        }
    }

    /// Run the pipeline and a trial load in a scratch unit, then install the
    /// artifacts. Nothing is left on disk on failure.
    async fn build_entry(
        &self,
        entry: RepositoryEntry,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RepositoryEntry, BridgeError> {
        let mut unit = self.folder.create_work_unit(entry)?;
        tokio::fs::write(unit.package_path(), bytes).await?;

        check_cancelled(cancel)?;
        self.pipeline.convert_to_archive(&mut unit).await?;
        check_cancelled(cancel)?;
        self.pipeline.compile_to_module(&mut unit).await?;
        check_cancelled(cancel)?;

        let trial = self.loader.load(&unit.entry, &unit.module_path()).await?;
        let reported: Vec<SourceInfo> = trial.sources().iter().map(|s| s.info().clone()).collect();
        reconcile_sources(&mut unit.entry.extension, &reported);
        if let Err(e) = trial.shutdown().await {
            tracing::warn!(package = %unit.entry.extension.package, "trial instance failed to shut down: {e}");
        }

        self.folder.install(&unit).await?;
        Ok(unit.into_entry())
    }

    /// Rebuild archive and module from the stored package, keeping everything
    /// else the entry already records.
    async fn rebuild_entry(
        &self,
        entry: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<RepositoryEntry, BridgeError> {
        let bytes = tokio::fs::read(self.folder.package_path(entry)).await?;

        let mut scratch = entry.clone();
        scratch.archive = None;
        scratch.module = None;
        let mut unit = self.folder.create_work_unit(scratch)?;
        tokio::fs::write(unit.package_path(), &bytes).await?;

        check_cancelled(cancel)?;
        self.pipeline.convert_to_archive(&mut unit).await?;
        check_cancelled(cancel)?;
        self.pipeline.compile_to_module(&mut unit).await?;

        if unit.entry.extension.package != entry.extension.package {
            return Err(ConversionError::InvalidManifest(format!(
                "stored package now declares '{}'",
                unit.entry.extension.package
            ))
            .into());
        }
        self.folder.install(&unit).await?;

        let built = unit.into_entry();
        let mut updated = entry.clone();
        updated.archive = built.archive;
        updated.module = built.module;
        Ok(updated)
    }

    // ─── Installing ─────────────────────────────────────────────────────

    /// Install a package. Re-adding identical bytes returns the existing group.
    ///
    /// The first version of a package becomes active without being loaded.
    /// With `force` the new version becomes active and, if the package is
    /// loaded, is swapped in; a failed swap keeps the previous version active.
    pub async fn add_extension(
        &self,
        bytes: &[u8],
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<RepositoryGroup, BridgeError> {
        let id = sha256_hex(bytes);
        let entry = self.new_entry(&id);
        self.add_built(entry, bytes, force, None, cancel).await
    }

    /// Download the package `descriptor` points at and install it.
    pub async fn add_remote_extension(
        &self,
        repo: &RemoteRepository,
        descriptor: &ExtensionDescriptor,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<RepositoryGroup, BridgeError> {
        if repo.find_package(&descriptor.package).is_none() {
            return Err(BridgeError::NotFound(format!(
                "{} in repository {}",
                descriptor.package, repo.url
            )));
        }

        let bytes = self
            .downloader
            .download_package(&repo.url, descriptor, cancel)
            .await?;

        let mut entry = self.new_entry(&sha256_hex(&bytes));
        entry.is_local = false;
        entry.repository_id = Some(repo.id.clone());
        entry.download_url = Some(package_url(&repo.url, descriptor));
        entry.extension.package_file = descriptor.package_file.clone();

        self.add_built(entry, &bytes, force, Some(&descriptor.package), cancel)
            .await
    }

    async fn add_built(
        &self,
        entry: RepositoryEntry,
        bytes: &[u8],
        force: bool,
        expected_package: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RepositoryGroup, BridgeError> {
        if let Some(group) = self.group_containing(entry.id()).await {
            tracing::debug!(package = %group.package, entry = %entry.id(), "package already installed");
            return Ok(group);
        }

        let entry = self.build_entry(entry, bytes, cancel).await?;
        let package = entry.extension.package.clone();
        if let Some(expected) = expected_package {
            if expected != package {
                self.folder.remove_entry(&entry).await?;
                self.folder.remove_package_if_empty(&package).await?;
                return Err(ConversionError::InvalidManifest(format!(
                    "repository lists '{expected}' but the package declares '{package}'"
                ))
                .into());
            }
        }

        let lock = self.group_lock(&package);
        let _guard = lock.lock().await;

        let (group, previous_active, new_idx) = {
            let mut groups = self.groups.write().await;
            if let Some(existing) = groups
                .get(&package)
                .filter(|g| g.find_entry(entry.id()).is_some())
            {
                // Lost a race with an identical install.
                return Ok(existing.clone());
            }

            let group = groups
                .entry(package.clone())
                .or_insert_with(|| RepositoryGroup::new(package.clone(), entry.name.clone()));
            group.name = entry.name.clone();
            group.entries.push(entry.clone());
            let new_idx = group.entries.len() - 1;

            let previous_active = group.active_entry;
            if previous_active.is_none() || force {
                group.active_entry = Some(new_idx);
            }
            let snapshot = group.clone();
            self.save(&groups).await?;
            (snapshot, previous_active, new_idx)
        };

        tracing::info!(
            package = %package,
            version = %entry.extension.version,
            entry = %entry.id(),
            local = entry.is_local,
            "extension version installed"
        );

        let swap_needed = force && previous_active.is_some_and(|idx| idx != new_idx);
        if !swap_needed {
            return Ok(group);
        }
        let Some(handle) = self.existing_handle(&package).filter(|h| h.is_loaded()) else {
            return Ok(group);
        };

        let module_path = self.folder.module_path(&entry);
        if let Err(e) = handle.swap_to(&entry, &module_path, cancel).await {
            let mut groups = self.groups.write().await;
            if let Some(group) = groups.get_mut(&package) {
                group.active_entry = previous_active;
            }
            self.save(&groups).await?;
            return Err(e.into());
        }
        Ok(group)
    }

    // ─── Removing ───────────────────────────────────────────────────────

    /// Remove one version. Returns `None` when it was the last one and the
    /// package was pruned.
    pub async fn remove_extension_version(
        &self,
        package: &str,
        entry_id: &str,
    ) -> Result<Option<RepositoryGroup>, BridgeError> {
        let lock = self.group_lock(package);
        let _guard = lock.lock().await;

        let (removed, was_active, remaining) = {
            let mut groups = self.groups.write().await;
            let group = groups
                .get_mut(package)
                .ok_or_else(|| BridgeError::NotFound(package.to_string()))?;
            let (removed, was_active) = group
                .remove_entry(entry_id)
                .ok_or_else(|| BridgeError::NotFound(format!("{package} entry {entry_id}")))?;

            let remaining = if group.entries.is_empty() {
                groups.remove(package);
                None
            } else {
                Some(group.clone())
            };
            self.save(&groups).await?;
            (removed, was_active, remaining)
        };

        match &remaining {
            None => {
                if let Some(handle) = self.take_handle(package) {
                    handle.shutdown().await;
                }
                self.folder.remove_package(package).await?;
                self.preferences.forget(package);
                self.forget_group_lock(package, &lock);
            }
            Some(_) => {
                if was_active {
                    if let Some(handle) = self.existing_handle(package) {
                        handle.unload().await;
                    }
                }
                self.folder.remove_entry(&removed).await?;
            }
        }

        tracing::info!(
            package = %package,
            version = %removed.extension.version,
            was_active,
            pruned = remaining.is_none(),
            "extension version removed"
        );
        Ok(remaining)
    }

    /// Remove every version of a package along with its preferences.
    pub async fn remove_extension(&self, package: &str) -> Result<(), BridgeError> {
        let lock = self.group_lock(package);
        let _guard = lock.lock().await;

        {
            let mut groups = self.groups.write().await;
            if groups.remove(package).is_none() {
                return Err(BridgeError::NotFound(package.to_string()));
            }
            self.save(&groups).await?;
        }

        if let Some(handle) = self.take_handle(package) {
            handle.shutdown().await;
        }
        self.folder.remove_package(package).await?;
        self.preferences.forget(package);
        self.forget_group_lock(package, &lock);

        tracing::info!(package = %package, "extension removed");
        Ok(())
    }

    // ─── Activation ─────────────────────────────────────────────────────

    /// Make `entry_id` the active version and swap it in.
    ///
    /// The active index only changes once the swap succeeded.
    pub async fn set_active_version(
        &self,
        package: &str,
        entry_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RepositoryGroup, BridgeError> {
        let lock = self.group_lock(package);
        let _guard = lock.lock().await;

        let (idx, entry) = {
            let groups = self.groups.read().await;
            let group = groups
                .get(package)
                .ok_or_else(|| BridgeError::NotFound(package.to_string()))?;
            let idx = group
                .position(entry_id)
                .ok_or_else(|| BridgeError::NotFound(format!("{package} entry {entry_id}")))?;
            (idx, group.entries[idx].clone())
        };

        let handle = self.handle_for(package);
        handle
            .swap_to(&entry, &self.folder.module_path(&entry), cancel)
            .await?;

        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(package)
            .ok_or_else(|| BridgeError::NotFound(package.to_string()))?;
        group.active_entry = Some(idx);
        let snapshot = group.clone();
        self.save(&groups).await?;

        tracing::info!(package = %package, version = %entry.extension.version, "active version changed");
        Ok(snapshot)
    }

    pub async fn set_auto_update(
        &self,
        package: &str,
        auto_update: bool,
    ) -> Result<RepositoryGroup, BridgeError> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(package)
            .ok_or_else(|| BridgeError::NotFound(package.to_string()))?;
        group.auto_update = auto_update;
        let snapshot = group.clone();
        self.save(&groups).await?;
        Ok(snapshot)
    }

    /// Stable handle for a package, loading its active version on first use.
    pub async fn get_interop(
        &self,
        package: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtensionHandle, BridgeError> {
        let active_id = self.active_entry_id(package).await?;
        let handle = self.handle_for(package);
        if handle.loaded_entry_id().as_deref() == Some(active_id.as_str()) {
            return Ok(handle);
        }

        let lock = self.group_lock(package);
        let _guard = lock.lock().await;

        // Re-read under the lock; an activation may have run meanwhile.
        let active = {
            let groups = self.groups.read().await;
            groups
                .get(package)
                .and_then(|g| g.active().cloned())
                .ok_or_else(|| BridgeError::NotFound(format!("{package} has no active version")))?
        };
        if handle.loaded_entry_id().as_deref() != Some(active.id()) {
            handle
                .swap_to(&active, &self.folder.module_path(&active), cancel)
                .await?;
        }
        Ok(handle)
    }

    async fn active_entry_id(&self, package: &str) -> Result<String, BridgeError> {
        let groups = self.groups.read().await;
        let group = groups
            .get(package)
            .ok_or_else(|| BridgeError::NotFound(package.to_string()))?;
        group
            .active()
            .map(|e| e.id().to_string())
            .ok_or_else(|| BridgeError::NotFound(format!("{package} has no active version")))
    }

    // ─── Recompilation ──────────────────────────────────────────────────

    /// Rebuild the given entries whose module is missing or was built by
    /// another toolchain. Returns how many were rebuilt.
    ///
    /// A rebuilt active entry that is currently loaded is swapped in through
    /// its handle. Failures are logged and skipped.
    pub async fn validate_and_recompile(
        &self,
        entry_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<usize, BridgeError> {
        let mut rebuilt = 0;

        for entry_id in entry_ids {
            check_cancelled(cancel)?;

            let Some(group) = self.group_containing(entry_id).await else {
                tracing::warn!(entry = %entry_id, "cannot validate unknown entry");
                continue;
            };
            let package = group.package.clone();

            let lock = self.group_lock(&package);
            let _guard = lock.lock().await;

            let Some(entry) = self
                .find_extension(&package)
                .await
                .and_then(|g| g.find_entry(entry_id).cloned())
            else {
                continue;
            };

            let module_present = tokio::fs::try_exists(self.folder.module_path(&entry))
                .await
                .unwrap_or(false);
            if module_present && !self.pipeline.is_stale(&entry) {
                continue;
            }

            let updated = match self.rebuild_entry(&entry, cancel).await {
                Ok(updated) => updated,
                Err(BridgeError::Cancelled) => return Err(BridgeError::Cancelled),
                Err(e) => {
                    tracing::error!(package = %package, entry = %entry_id, "recompilation failed: {e}");
                    continue;
                }
            };

            let is_active = {
                let mut groups = self.groups.write().await;
                let Some(group) = groups.get_mut(&package) else {
                    continue;
                };
                let Some(idx) = group.position(entry_id) else {
                    continue;
                };
                group.entries[idx] = updated.clone();
                let is_active = group.active_entry == Some(idx);
                self.save(&groups).await?;
                is_active
            };
            rebuilt += 1;

            tracing::info!(
                package = %package,
                entry = %entry_id,
                toolchain = self.pipeline.toolchain_version(),
                "extension recompiled"
            );

            if is_active {
                if let Some(handle) = self.existing_handle(&package).filter(|h| h.is_loaded()) {
                    let module_path = self.folder.module_path(&updated);
                    if let Err(e) = handle.swap_to(&updated, &module_path, cancel).await {
                        tracing::error!(package = %package, "failed to swap in recompiled module: {e}");
                    }
                }
            }
        }

        Ok(rebuilt)
    }

    /// [`validate_and_recompile`](Self::validate_and_recompile) over every installed entry.
    pub async fn validate_all(&self, cancel: &CancellationToken) -> Result<usize, BridgeError> {
        let ids: Vec<String> = {
            let groups = self.groups.read().await;
            groups
                .values()
                .flat_map(|g| g.entries.iter().map(|e| e.id().to_string()))
                .collect()
        };
        self.validate_and_recompile(&ids, cancel).await
    }

    // ─── Auto-update ────────────────────────────────────────────────────

    /// Install and activate strictly newer remote versions of every package
    /// with auto-update enabled. Returns how many packages were updated.
    pub async fn compare_online_with_local_and_auto_update(
        &self,
        repos: &[RemoteRepository],
        cancel: &CancellationToken,
    ) -> Result<usize, BridgeError> {
        let candidates: Vec<(String, i64)> = {
            let groups = self.groups.read().await;
            groups
                .values()
                .filter(|g| g.auto_update)
                .map(|g| {
                    let local = g.latest().map(|e| e.version_code()).unwrap_or(-1);
                    (g.package.clone(), local)
                })
                .collect()
        };

        let mut updated = 0;
        for (package, local_code) in candidates {
            check_cancelled(cancel)?;

            let newest = repos
                .iter()
                .filter_map(|repo| repo.find_package(&package).map(|d| (repo, d)))
                .max_by_key(|(_, d)| d.version_code);
            let Some((repo, descriptor)) = newest else {
                continue;
            };
            if descriptor.version_code <= local_code {
                continue;
            }

            tracing::info!(
                package = %package,
                from = local_code,
                to = descriptor.version_code,
                repository = %repo.url,
                "auto-updating extension"
            );
            match self.add_remote_extension(repo, descriptor, true, cancel).await {
                Ok(_) => updated += 1,
                Err(BridgeError::Cancelled) => return Err(BridgeError::Cancelled),
                Err(e) => tracing::error!(package = %package, "auto-update failed: {e}"),
            }
        }

        Ok(updated)
    }

    /// Terminate every handle. The store is unusable for calls afterwards.
    pub async fn shutdown(&self) {
        let handles: Vec<ExtensionHandle> = {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
        tracing::info!("extension store shut down");
    }
}
