//! Stage one: package → consolidated archive.
//!
//! Checks the binary is a plain WebAssembly core module importing only from
//! the allowed host namespaces, extracts the embedded manifest, and re-emits
//! every other section unchanged.

use wasmparser::{Encoding, Parser, Payload};

use crate::error::ConversionError;
use crate::pipeline::manifest::{PackageManifest, MANIFEST_SECTION};

// ─── Constants ──────────────────────────────────────────────────────────

/// WASM magic bytes: `\0asm`
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Allowed WASM import namespaces. Imports outside these are rejected.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",                    // Extism host functions
    "extism:host/env",        // Extism host functions (component model)
    "wasi_snapshot_preview1", // WASI preview 1 (enabled in sandbox)
    "wasi_unstable",          // Legacy WASI
];

/// Custom section id.
const CUSTOM_SECTION_ID: u8 = 0;

// ─── Section encoding ───────────────────────────────────────────────────

pub(crate) fn write_leb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn push_section(out: &mut Vec<u8>, id: u8, contents: &[u8]) {
    out.push(id);
    write_leb128(out, contents.len() as u32);
    out.extend_from_slice(contents);
}

pub(crate) fn push_custom_section(out: &mut Vec<u8>, name: &str, data: &[u8]) {
    let mut contents = Vec::with_capacity(name.len() + data.len() + 5);
    write_leb128(&mut contents, name.len() as u32);
    contents.extend_from_slice(name.as_bytes());
    contents.extend_from_slice(data);
    push_section(out, CUSTOM_SECTION_ID, &contents);
}

// ─── Conversion ─────────────────────────────────────────────────────────

/// Result of stage one.
#[derive(Debug)]
pub struct ConvertedPackage {
    pub manifest: PackageManifest,
    /// The module without its manifest section.
    pub archive: Vec<u8>,
}

pub fn convert(bytes: &[u8]) -> Result<ConvertedPackage, ConversionError> {
    if bytes.len() < 8 || &bytes[..4] != WASM_MAGIC {
        return Err(ConversionError::NotWasm("magic bytes mismatch".into()));
    }

    let mut manifest_text: Option<String> = None;
    let mut archive = Vec::with_capacity(bytes.len());

    for payload in Parser::new(0).parse_all(bytes) {
        let payload =
            payload.map_err(|e| ConversionError::NotWasm(format!("failed to parse WASM: {e}")))?;

        match &payload {
            Payload::Version {
                encoding, range, ..
            } => {
                if matches!(encoding, Encoding::Component) {
                    return Err(ConversionError::Unsupported(
                        "component-model binaries are not supported".into(),
                    ));
                }
                archive.extend_from_slice(&bytes[range.clone()]);
                continue;
            }
            Payload::ImportSection(reader) => {
                for import in reader.clone() {
                    let import = import.map_err(|e| {
                        ConversionError::NotWasm(format!("failed to read import: {e}"))
                    })?;
                    if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                        return Err(ConversionError::Unsupported(format!(
                            "unauthorized import namespace: '{}' (function: '{}'); \
                             allowed namespaces: {:?}",
                            import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                        )));
                    }
                }
            }
            Payload::CustomSection(reader) if reader.name() == MANIFEST_SECTION => {
                if manifest_text.is_some() {
                    return Err(ConversionError::InvalidManifest(
                        "package declares more than one manifest section".into(),
                    ));
                }
                let text = std::str::from_utf8(reader.data()).map_err(|e| {
                    ConversionError::InvalidManifest(format!("manifest is not UTF-8: {e}"))
                })?;
                manifest_text = Some(text.to_string());
                continue;
            }
            _ => {}
        }

        if let Some((id, range)) = payload.as_section() {
            push_section(&mut archive, id, &bytes[range]);
        }
    }

    let manifest_text = manifest_text.ok_or_else(|| {
        ConversionError::InvalidManifest(format!("missing '{MANIFEST_SECTION}' section"))
    })?;
    let manifest = PackageManifest::parse_and_validate(&manifest_text)?;

    Ok(ConvertedPackage { manifest, archive })
}

// ─── Tests ──────────────────────────────────────────────────────────────
