//! Bridge configuration read from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::sandbox::SandboxConfig;

/// Default max package size: 50 MB.
const DEFAULT_MAX_PACKAGE_SIZE_MB: u64 = 50;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Root of the on-disk layout (metadata files, artifacts, preferences).
    pub base_dir: PathBuf,
    /// Scratch root for pipeline work units (default: `<base_dir>/tmp`).
    pub temp_dir: Option<PathBuf>,
    /// Upper bound on waiting for in-flight calls during unload/shutdown.
    pub drain_timeout: Duration,
    pub http_timeout: Duration,
    pub max_package_size: u64,
    pub sandbox: SandboxConfig,
}

impl BridgeConfig {
    /// Defaults rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            temp_dir: None,
            drain_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(300),
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE_MB * 1024 * 1024,
            sandbox: SandboxConfig::default(),
        }
    }

    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let base_dir =
            std::env::var("EXTBRIDGE_DIR").unwrap_or_else(|_| "./data/extbridge".to_string());

        Self {
            base_dir: PathBuf::from(base_dir),
            temp_dir: std::env::var("EXTBRIDGE_TEMP_DIR").ok().map(PathBuf::from),
            drain_timeout: Duration::from_secs(
                std::env::var("EXTBRIDGE_DRAIN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            http_timeout: Duration::from_secs(
                std::env::var("EXTBRIDGE_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            max_package_size: std::env::var("EXTBRIDGE_MAX_PACKAGE_SIZE_MB")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_MAX_PACKAGE_SIZE_MB)
                * 1024
                * 1024,
            sandbox: SandboxConfig::from_env(),
        }
    }

    pub fn extensions_file(&self) -> PathBuf {
        self.base_dir.join("extensions.json")
    }

    pub fn repositories_file(&self) -> PathBuf {
        self.base_dir.join("repositories.json")
    }

    pub fn extensions_dir(&self) -> PathBuf {
        self.base_dir.join("extensions")
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("tmp"))
    }
}
