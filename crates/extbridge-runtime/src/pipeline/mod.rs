//! Conversion pipeline: package → archive → module.
//!
//! Both stages read and write only inside an [`ExtensionWorkUnit`]; nothing
//! reaches the installed tree until the version store copies the finished
//! artifacts into place. Each output is stamped with the pipeline's
//! toolchain version so stale modules can be found without re-parsing them.

pub mod compiler;
pub mod converter;
pub mod manifest;

use extbridge_models::{ArtifactHash, RepositoryEntry};

use crate::error::{CompileError, ConversionError};
use crate::folder::{ExtensionWorkUnit, ARCHIVE_FILE, MODULE_FILE};
use crate::identity::sha256_hex;

/// Bump whenever archive or module output changes for the same package bytes.
pub const TOOLCHAIN_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct Pipeline {
    toolchain_version: u32,
    max_package_size: u64,
}

impl Pipeline {
    pub fn new(max_package_size: u64) -> Self {
        Self {
            toolchain_version: TOOLCHAIN_VERSION,
            max_package_size,
        }
    }

    pub fn with_toolchain_version(mut self, version: u32) -> Self {
        self.toolchain_version = version;
        self
    }

    pub fn toolchain_version(&self) -> u32 {
        self.toolchain_version
    }

    pub fn max_package_size(&self) -> u64 {
        self.max_package_size
    }

    /// Whether the entry's archive or module was built by another toolchain.
    pub fn is_stale(&self, entry: &RepositoryEntry) -> bool {
        let current = |hash: &Option<ArtifactHash>| {
            hash.as_ref()
                .is_some_and(|h| h.version == self.toolchain_version)
        };
        !current(&entry.archive) || !current(&entry.module)
    }

    /// Stage one. Fills the unit's descriptor from the package manifest.
    pub async fn convert_to_archive(
        &self,
        unit: &mut ExtensionWorkUnit,
    ) -> Result<ArtifactHash, ConversionError> {
        let size = tokio::fs::metadata(unit.package_path()).await?.len();
        if size > self.max_package_size {
            return Err(ConversionError::TooLarge {
                size,
                max: self.max_package_size,
            });
        }

        let bytes = tokio::fs::read(unit.package_path()).await?;
        let converted = converter::convert(&bytes)?;
        tokio::fs::write(unit.archive_path(), &converted.archive).await?;

        let hash = ArtifactHash::new(
            ARCHIVE_FILE,
            sha256_hex(&converted.archive),
            self.toolchain_version,
        );

        let mut descriptor = converted.manifest.to_descriptor();
        descriptor.package_file = std::mem::take(&mut unit.entry.extension.package_file);
        unit.entry.name = descriptor.display_name().to_string();
        unit.entry.entry_point = converted.manifest.extension.entry_point.clone();
        unit.entry.extension = descriptor;
        unit.entry.archive = Some(hash.clone());

        tracing::debug!(
            package = %unit.entry.extension.package,
            version = %unit.entry.extension.version,
            archive = %hash.sha256,
            "package converted to archive"
        );

        Ok(hash)
    }

    /// Stage two.
    pub async fn compile_to_module(
        &self,
        unit: &mut ExtensionWorkUnit,
    ) -> Result<ArtifactHash, CompileError> {
        let archive = match tokio::fs::read(unit.archive_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CompileError::MissingArchive)
            }
            Err(e) => return Err(e.into()),
        };

        let module = compiler::compile(&archive, self.toolchain_version)?;
        tokio::fs::write(unit.module_path(), &module).await?;

        let hash = ArtifactHash::new(MODULE_FILE, sha256_hex(&module), self.toolchain_version);
        unit.entry.module = Some(hash.clone());

        tracing::debug!(
            package = %unit.entry.extension.package,
            module = %hash.sha256,
            toolchain = self.toolchain_version,
            "archive compiled to module"
        );

        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::folder::WorkingFolder;
    use crate::test_support::{module_bytes, package_bytes, skeleton_entry};

    async fn unit_with(folder: &WorkingFolder, bytes: &[u8]) -> ExtensionWorkUnit {
        let unit = folder.create_work_unit(skeleton_entry(&sha256_hex(bytes))).unwrap();
        tokio::fs::write(unit.package_path(), bytes).await.unwrap();
        unit
    }

    #[tokio::test]
    async fn test_full_pipeline_fills_entry() {
        let dir = tempfile::tempdir().unwrap();
        let folder = WorkingFolder::new(&BridgeConfig::new(dir.path()));
        let pipeline = Pipeline::new(1024 * 1024);

        let mut unit = unit_with(&folder, &package_bytes("a.b.extension.en.test", "1.4.2", 2)).await;
        unit.entry.extension.package_file = "test-v1.4.2.apk".into();

        let archive = pipeline.convert_to_archive(&mut unit).await.unwrap();
        let module = pipeline.compile_to_module(&mut unit).await.unwrap();

        assert_eq!(archive.file_name, ARCHIVE_FILE);
        assert_eq!(module.version, TOOLCHAIN_VERSION);
        assert!(unit.module_path().exists());
        assert_eq!(
            crate::identity::hash_file(&unit.module_path()).await.unwrap(),
            module.sha256
        );

        let entry = unit.into_entry();
        assert_eq!(entry.extension.package, "a.b.extension.en.test");
        assert_eq!(entry.extension.language, "en");
        assert_eq!(entry.extension.version_code, 2);
        assert_eq!(entry.extension.package_file, "test-v1.4.2.apk");
        assert_eq!(entry.entry_point, ".TestSource");
        assert!(!pipeline.is_stale(&entry));
        assert!(pipeline.clone().with_toolchain_version(2).is_stale(&entry));
    }

    #[tokio::test]
    async fn test_package_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let folder = WorkingFolder::new(&BridgeConfig::new(dir.path()));
        let pipeline = Pipeline::new(16);

        let mut unit = unit_with(&folder, &package_bytes("a.b.test", "1.0", 1)).await;
        let err = pipeline.convert_to_archive(&mut unit).await.unwrap_err();
        assert!(matches!(err, ConversionError::TooLarge { max: 16, .. }));
        assert!(!unit.archive_path().exists());
    }

    #[tokio::test]
    async fn test_compile_without_archive() {
        let dir = tempfile::tempdir().unwrap();
        let folder = WorkingFolder::new(&BridgeConfig::new(dir.path()));
        let pipeline = Pipeline::new(1024 * 1024);

        let mut unit = unit_with(&folder, &module_bytes(&["sources"], &[])).await;
        let err = pipeline.compile_to_module(&mut unit).await.unwrap_err();
        assert!(matches!(err, CompileError::MissingArchive));
    }

    #[tokio::test]
    async fn test_failed_conversion_leaves_no_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::new(dir.path());
        let folder = WorkingFolder::new(&config);
        let pipeline = Pipeline::new(1024 * 1024);

        let scratch = {
            let mut unit = unit_with(&folder, b"definitely not wasm").await;
            assert!(pipeline.convert_to_archive(&mut unit).await.is_err());
            unit.path().to_path_buf()
        };
        assert!(!scratch.exists());
        assert_eq!(std::fs::read_dir(config.temp_root()).unwrap().count(), 0);
    }

    #[test]
    fn test_is_stale_without_module() {
        let pipeline = Pipeline::new(1024);
        assert!(pipeline.is_stale(&skeleton_entry("h")));
    }
}
