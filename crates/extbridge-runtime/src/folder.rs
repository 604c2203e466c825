//! On-disk layout: per-entry artifact folders, preference folders, and
//! scoped scratch directories for pipeline runs.

use std::io;
use std::path::{Path, PathBuf};

use extbridge_models::RepositoryEntry;
use tempfile::TempDir;
use uuid::Uuid;

use crate::config::BridgeConfig;

pub const PACKAGE_FILE: &str = "package.wasm";
pub const ARCHIVE_FILE: &str = "archive.wasm";
pub const MODULE_FILE: &str = "module.wasm";

/// Write `data` to `path` through a sibling temp file and a rename.
pub async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// ─── Working folder ─────────────────────────────────────────────────────

/// Directory tree holding every installed artifact.
///
/// ```text
/// extensions/<package>/<package-sha256>/{package,archive,module}.wasm
/// extensions/<package>/preferences/<source-id>.json
/// ```
#[derive(Debug, Clone)]
pub struct WorkingFolder {
    extensions_dir: PathBuf,
    temp_dir: PathBuf,
}

impl WorkingFolder {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            extensions_dir: config.extensions_dir(),
            temp_dir: config.temp_root(),
        }
    }

    pub async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.extensions_dir).await?;
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        Ok(())
    }

    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.extensions_dir.join(package)
    }

    pub fn entry_dir(&self, entry: &RepositoryEntry) -> PathBuf {
        self.package_dir(&entry.extension.package).join(entry.id())
    }

    pub fn package_path(&self, entry: &RepositoryEntry) -> PathBuf {
        self.entry_dir(entry).join(PACKAGE_FILE)
    }

    pub fn module_path(&self, entry: &RepositoryEntry) -> PathBuf {
        self.entry_dir(entry).join(MODULE_FILE)
    }

    /// Open a scratch directory for one pipeline run over `entry`.
    pub fn create_work_unit(&self, entry: RepositoryEntry) -> io::Result<ExtensionWorkUnit> {
        std::fs::create_dir_all(&self.temp_dir)?;
        let dir = tempfile::Builder::new()
            .prefix("unit-")
            .tempdir_in(&self.temp_dir)?;
        Ok(ExtensionWorkUnit { dir, entry })
    }

    /// Copy every artifact the work unit produced into the entry's folder.
    pub async fn install(&self, unit: &ExtensionWorkUnit) -> io::Result<PathBuf> {
        let dest = self.entry_dir(&unit.entry);
        let fresh = !tokio::fs::try_exists(&dest).await.unwrap_or(false);
        tokio::fs::create_dir_all(&dest).await?;

        let result = async {
            for name in [PACKAGE_FILE, ARCHIVE_FILE, MODULE_FILE] {
                let src = unit.path().join(name);
                if !tokio::fs::try_exists(&src).await? {
                    continue;
                }
                let data = tokio::fs::read(&src).await?;
                write_atomic(&dest.join(name), &data).await?;
            }
            Ok::<_, io::Error>(())
        }
        .await;

        if let Err(e) = result {
            if fresh {
                let _ = remove_dir_if_exists(&dest).await;
            }
            return Err(e);
        }
        Ok(dest)
    }

    pub async fn remove_entry(&self, entry: &RepositoryEntry) -> io::Result<()> {
        remove_dir_if_exists(&self.entry_dir(entry)).await
    }

    /// Remove every version and the preferences of a package.
    pub async fn remove_package(&self, package: &str) -> io::Result<()> {
        remove_dir_if_exists(&self.package_dir(package)).await
    }

    /// Remove the package folder only if nothing is left in it.
    pub async fn remove_package_if_empty(&self, package: &str) -> io::Result<()> {
        let dir = self.package_dir(package);
        match tokio::fs::remove_dir(&dir).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                let mut entries = tokio::fs::read_dir(&dir).await?;
                match entries.next_entry().await? {
                    Some(_) => Ok(()),
                    None => Err(e),
                }
            }
            Ok(()) => Ok(()),
        }
    }
}

// ─── Work unit ──────────────────────────────────────────────────────────

/// A scratch directory paired with the entry being built in it.
///
/// The directory is deleted when the unit is dropped, on success and on
/// every error path.
#[derive(Debug)]
pub struct ExtensionWorkUnit {
    dir: TempDir,
    pub entry: RepositoryEntry,
}

impl ExtensionWorkUnit {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn package_path(&self) -> PathBuf {
        self.dir.path().join(PACKAGE_FILE)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir.path().join(ARCHIVE_FILE)
    }

    pub fn module_path(&self) -> PathBuf {
        self.dir.path().join(MODULE_FILE)
    }

    pub fn into_entry(self) -> RepositoryEntry {
        self.entry
    }
}
