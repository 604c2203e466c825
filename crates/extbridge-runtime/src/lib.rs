//! Extension bridge runtime
//!
//! Hosts third-party source extensions compiled to WebAssembly. Packages are
//! converted and compiled into loadable modules, versioned in a
//! content-addressed store, and run inside Extism sandboxes behind stable
//! handles whose live instance can be swapped while calls are in flight.

pub mod bridge;
pub mod config;
pub mod downloader;
pub mod error;
pub mod folder;
pub mod identity;
pub mod manager;
pub mod pipeline;
pub mod preference_store;
pub mod preferences;
pub mod repository;
pub mod runtime;

#[cfg(test)]
mod test_support;

pub use bridge::ExtensionBridge;
pub use config::BridgeConfig;
pub use downloader::{HttpRepositoryDownloader, RepositoryDownloader};
pub use error::{
    BridgeError, CompileError, ConversionError, GateError, PreferenceError, SandboxError,
    SwapError,
};
pub use folder::{ExtensionWorkUnit, WorkingFolder};
pub use manager::ExtensionManager;
pub use pipeline::{Pipeline, TOOLCHAIN_VERSION};
pub use preference_store::{PreferenceRegistry, PreferenceStore, PreferenceValue};
pub use repository::{normalize_url, RefreshReport, RepositoryManager};
pub use runtime::gate::{DrainOutcome, GatePhase};
pub use runtime::handle::{ExtensionHandle, SourceHandle};
pub use runtime::sandbox::{ExtensionSandbox, SandboxConfig};
pub use runtime::wasm::WasmLoader;
pub use runtime::{ExtensionInterop, InstanceLoader, SourceInterop};
