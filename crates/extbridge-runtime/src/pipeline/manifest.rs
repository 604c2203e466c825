//! Package manifest parsing and validation.
//!
//! Every package embeds a TOML manifest in the `extbridge.manifest` custom
//! section of its WebAssembly module.

use extbridge_models::ExtensionDescriptor;
use serde::{Deserialize, Serialize};

use crate::error::ConversionError;

/// Custom section carrying the manifest.
pub const MANIFEST_SECTION: &str = "extbridge.manifest";

/// Extension library versions this host can run (major.minor).
pub const LIB_VERSION_REQ: &str = ">=1.3.0, <1.6.0";

/// Manifest embedded in a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub extension: ExtensionMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionMeta {
    pub name: String,
    pub package: String,
    pub version: String,
    pub version_code: i64,
    pub lib_version: String,
    pub entry_point: String,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub nsfw: bool,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Package ids are dotted identifiers: `eu.kanade.tachiyomi.extension.en.foo`.
fn validate_package_id(package: &str) -> Result<(), ConversionError> {
    if package.is_empty() || package.len() > 255 {
        return Err(ConversionError::InvalidManifest(format!(
            "extension.package must be 1-255 characters, got {}",
            package.len()
        )));
    }
    if !package.contains('.') {
        return Err(ConversionError::InvalidManifest(format!(
            "extension.package must be a dotted identifier, got '{package}'"
        )));
    }
    for segment in package.split('.') {
        if segment.is_empty() {
            return Err(ConversionError::InvalidManifest(format!(
                "extension.package has an empty segment: '{package}'"
            )));
        }
        if let Some(ch) = segment
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '_')
        {
            return Err(ConversionError::InvalidManifest(format!(
                "extension.package contains invalid character '{ch}'"
            )));
        }
    }
    Ok(())
}

/// `lib_version` is `major.minor`; it must fall inside [`LIB_VERSION_REQ`].
fn validate_lib_version(lib_version: &str) -> Result<(), ConversionError> {
    let parsed = semver::Version::parse(&format!("{lib_version}.0")).map_err(|_| {
        ConversionError::InvalidManifest(format!(
            "extension.lib_version must be 'major.minor', got '{lib_version}'"
        ))
    })?;
    let req = semver::VersionReq::parse(LIB_VERSION_REQ)
        .map_err(|e| ConversionError::InvalidManifest(e.to_string()))?;
    if !req.matches(&parsed) {
        return Err(ConversionError::Unsupported(format!(
            "extension library version {lib_version} is outside the supported range {LIB_VERSION_REQ}"
        )));
    }
    Ok(())
}

impl PackageManifest {
    pub fn parse(toml_str: &str) -> Result<Self, ConversionError> {
        toml::from_str(toml_str).map_err(|e| ConversionError::InvalidManifest(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConversionError> {
        let ext = &self.extension;
        if ext.name.trim().is_empty() {
            return Err(ConversionError::InvalidManifest(
                "extension.name must not be empty".into(),
            ));
        }
        validate_package_id(&ext.package)?;
        if ext.version.trim().is_empty() {
            return Err(ConversionError::InvalidManifest(
                "extension.version must not be empty".into(),
            ));
        }
        if ext.version_code < 0 {
            return Err(ConversionError::InvalidManifest(format!(
                "extension.version_code must not be negative, got {}",
                ext.version_code
            )));
        }
        validate_lib_version(&ext.lib_version)?;
        if ext.entry_point.trim().is_empty() {
            return Err(ConversionError::InvalidManifest(
                "extension.entry_point must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn parse_and_validate(toml_str: &str) -> Result<Self, ConversionError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Declared language, else the `extension.<lang>.` segment of the package id.
    pub fn language(&self) -> String {
        if let Some(lang) = self.extension.lang.as_deref().filter(|l| !l.is_empty()) {
            return lang.to_string();
        }
        let segments: Vec<&str> = self.extension.package.split('.').collect();
        segments
            .windows(2)
            .find(|w| w[0] == "extension")
            .map(|w| w[1].to_string())
            .unwrap_or_else(|| "all".to_string())
    }

    /// Descriptor for a freshly converted package. Sources are filled in by the trial load.
    pub fn to_descriptor(&self) -> ExtensionDescriptor {
        ExtensionDescriptor {
            name: self.extension.name.clone(),
            package: self.extension.package.clone(),
            package_file: String::new(),
            language: self.language(),
            version_code: self.extension.version_code,
            version: self.extension.version.clone(),
            nsfw: i32::from(self.extension.nsfw),
            sources: Vec::new(),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
