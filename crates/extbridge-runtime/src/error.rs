//! Extension bridge error types.

use thiserror::Error;

/// A package could not be turned into a consolidated archive.
///
/// Permanent: retrying the same bytes fails the same way.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("not a WebAssembly package: {0}")]
    NotWasm(String),

    #[error("unsupported bytecode feature: {0}")]
    Unsupported(String),

    #[error("invalid package manifest: {0}")]
    InvalidManifest(String),

    #[error("package too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The archive could not be compiled into a host-loadable module.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("invalid module: {0}")]
    InvalidModule(String),

    #[error("module is missing required export '{0}'")]
    MissingExport(String),

    #[error("archive artifact missing from work unit")]
    MissingArchive,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Entering a gate failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    #[error("gate closed: cancelled while waiting for a swap to finish")]
    ClosedTimeout,

    #[error("extension is not loaded")]
    Unloaded,

    #[error("extension handle has been shut down")]
    Terminated,
}

/// A version swap did not happen. The previous instance stays in service.
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("failed to construct replacement instance: {0}")]
    Construct(String),

    #[error("swap cancelled while draining in-flight calls")]
    Cancelled,

    #[error("extension handle has been shut down")]
    Terminated,
}

#[derive(Error, Debug)]
pub enum PreferenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures raised inside the WASM sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to load module: {0}")]
    Load(String),

    #[error("plugin call failed: {0}")]
    Call(String),

    #[error("execution timeout: plugin {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: plugin {0}")]
    MemoryExceeded(String),

    #[error("plugin does not export '{0}'")]
    Unsupported(String),

    #[error("plugin call cancelled")]
    Cancelled,

    #[error("invalid plugin output: {0}")]
    InvalidOutput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Umbrella error returned by the version store, repository manager and handles.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Swap(#[from] SwapError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Preference(#[from] PreferenceError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid repository URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::Http(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    // ── Display messages ──────────────────────────────────────────────

    #[test]
    fn test_display_conversion_too_large() {
        let err = ConversionError::TooLarge { size: 108, max: 50 };
        assert_eq!(
            err.to_string(),
            "package too large: 108 bytes (max: 50 bytes)"
        );
    }

    #[test]
    fn test_display_missing_export() {
        let err = CompileError::MissingExport("search".into());
        assert_eq!(err.to_string(), "module is missing required export 'search'");
    }

    #[test]
    fn test_display_gate_closed_timeout() {
        assert!(GateError::ClosedTimeout.to_string().contains("cancelled"));
    }

    #[test]
    fn test_bridge_error_is_transparent() {
        let err: BridgeError = SwapError::Construct("trap".into()).into();
        assert_eq!(
            err.to_string(),
            "failed to construct replacement instance: trap"
        );
    }

    // ── From conversions ──────────────────────────────────────────────

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: BridgeError = io_err.into();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn test_from_gate_error() {
        let err: BridgeError = GateError::Terminated.into();
        assert!(matches!(err, BridgeError::Gate(GateError::Terminated)));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("bad json{{{").unwrap_err();
        let err: SandboxError = json_err.into();
        assert!(matches!(err, SandboxError::Serialization(_)));
    }

    #[test]
    fn test_error_source_string_variants() {
        use std::error::Error;
        let err = SandboxError::Call("timeout".into());
        assert!(err.source().is_none());
    }
}
