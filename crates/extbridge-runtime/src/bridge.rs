//! Entry point wiring the version store, repository manager and WASM loader
//! over one on-disk layout.

use std::sync::Arc;

use extbridge_models::RepositoryGroup;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::downloader::{HttpRepositoryDownloader, RepositoryDownloader};
use crate::error::BridgeError;
use crate::manager::ExtensionManager;
use crate::pipeline::Pipeline;
use crate::preference_store::PreferenceRegistry;
use crate::repository::RepositoryManager;
use crate::runtime::handle::ExtensionHandle;
use crate::runtime::wasm::WasmLoader;

pub struct ExtensionBridge {
    config: BridgeConfig,
    extensions: Arc<ExtensionManager>,
    repositories: RepositoryManager,
}

impl ExtensionBridge {
    /// Open the bridge rooted at `config.base_dir`.
    ///
    /// Installed modules built by an older toolchain are rebuilt before
    /// this returns.
    pub async fn open(config: BridgeConfig) -> Result<Self, BridgeError> {
        tracing::info!(
            base_dir = %config.base_dir.display(),
            memory_limit_mb = config.sandbox.memory_limit / (1024 * 1024),
            fuel_limit = config.sandbox.fuel_limit,
            pool_size = config.sandbox.pool_size,
            "opening extension bridge"
        );

        let preferences = Arc::new(PreferenceRegistry::new(config.extensions_dir()));
        let loader = Arc::new(WasmLoader::new(config.sandbox.clone(), preferences.clone()));
        let downloader: Arc<dyn RepositoryDownloader> = Arc::new(HttpRepositoryDownloader::new(
            config.http_timeout,
            config.max_package_size,
        )?);

        let extensions = Arc::new(
            ExtensionManager::open(
                &config,
                Pipeline::new(config.max_package_size),
                loader,
                downloader.clone(),
                preferences,
            )
            .await?,
        );
        let repositories = RepositoryManager::open(&config, downloader, extensions.clone()).await?;

        let rebuilt = extensions.validate_all(&CancellationToken::new()).await?;
        if rebuilt > 0 {
            tracing::info!(rebuilt, "stale extension modules recompiled");
        }

        Ok(Self {
            config,
            extensions,
            repositories,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn extensions(&self) -> &ExtensionManager {
        &self.extensions
    }

    pub fn repositories(&self) -> &RepositoryManager {
        &self.repositories
    }

    /// Install the newest listing of `package` from the subscribed repositories.
    pub async fn install_from_repository(
        &self,
        package: &str,
        cancel: &CancellationToken,
    ) -> Result<RepositoryGroup, BridgeError> {
        let (repo, descriptor) = self
            .repositories
            .find_extension(package)
            .await
            .ok_or_else(|| BridgeError::NotFound(format!("{package} in any repository")))?;
        self.extensions
            .add_remote_extension(&repo, &descriptor, false, cancel)
            .await
    }

    pub async fn get_interop(
        &self,
        package: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtensionHandle, BridgeError> {
        self.extensions.get_interop(package, cancel).await
    }

    pub async fn shutdown(&self) {
        self.extensions.shutdown().await;
    }
}
