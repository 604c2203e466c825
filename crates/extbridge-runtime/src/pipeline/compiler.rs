//! Stage two: archive → host-loadable module.

use std::collections::HashSet;

use wasmparser::{ExternalKind, Parser, Payload, Validator};

use crate::error::CompileError;
use crate::pipeline::converter::push_custom_section;

/// Functions every extension module must export.
pub const REQUIRED_EXPORTS: &[&str] = &["sources", "popular", "search", "details", "chapters", "pages"];

/// Custom section stamped with the toolchain version that built the module.
pub const TOOLCHAIN_SECTION: &str = "extbridge.toolchain";

/// Validate the archive against the host feature set and the plugin ABI,
/// then stamp it with `toolchain_version`.
pub fn compile(archive: &[u8], toolchain_version: u32) -> Result<Vec<u8>, CompileError> {
    Validator::new()
        .validate_all(archive)
        .map_err(|e| CompileError::InvalidModule(e.to_string()))?;

    let mut exports = HashSet::new();
    for payload in Parser::new(0).parse_all(archive) {
        let payload = payload.map_err(|e| CompileError::InvalidModule(e.to_string()))?;
        if let Payload::ExportSection(reader) = payload {
            for export in reader {
                let export = export.map_err(|e| CompileError::InvalidModule(e.to_string()))?;
                if export.kind == ExternalKind::Func {
                    exports.insert(export.name.to_string());
                }
            }
        }
    }

    if let Some(missing) = REQUIRED_EXPORTS.iter().find(|name| !exports.contains(**name)) {
        return Err(CompileError::MissingExport((*missing).to_string()));
    }

    let mut module = archive.to_vec();
    push_custom_section(&mut module, TOOLCHAIN_SECTION, &toolchain_version.to_le_bytes());
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::module_bytes;

    #[test]
    fn test_compile_accepts_full_abi() {
        let archive = module_bytes(REQUIRED_EXPORTS, &[]);
        let module = compile(&archive, 1).unwrap();
        assert!(module.len() > archive.len());
        Validator::new().validate_all(&module).unwrap();
    }

    #[test]
    fn test_toolchain_version_changes_output() {
        let archive = module_bytes(REQUIRED_EXPORTS, &[]);
        assert_ne!(compile(&archive, 1).unwrap(), compile(&archive, 2).unwrap());
        assert_eq!(compile(&archive, 1).unwrap(), compile(&archive, 1).unwrap());
    }

    #[test]
    fn test_missing_export() {
        let archive = module_bytes(&["sources", "popular"], &[]);
        let err = compile(&archive, 1).unwrap_err();
        assert!(matches!(err, CompileError::MissingExport(ref name) if name == "search"));
    }

    #[test]
    fn test_invalid_module() {
        // Function section declares a body that the code section never provides.
        let archive = vec![
            0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, // header
            0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type section
            0x03, 0x02, 0x01, 0x00, // function section: 1 func of type 0
        ];
        let err = compile(&archive, 1).unwrap_err();
        assert!(matches!(err, CompileError::InvalidModule(_)));
    }
}
