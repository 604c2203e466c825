//! WASM extension sandbox using Extism (wasmtime).
//!
//! Each loaded module runs in its own isolated sandbox with a memory cap,
//! fuel-based execution limits, a wall-clock call timeout and an allow-list
//! of hosts for outbound HTTP.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::SandboxError;

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 64 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per execution (default: 500_000_000).
    pub fuel_limit: u64,
    /// Wall-clock limit per call in seconds (default: 120).
    pub call_timeout_secs: u64,
    /// Sandboxes per loaded module, i.e. how many calls run at once (default: 4).
    pub pool_size: usize,
    /// Hosts the module may reach over HTTP (default: any).
    pub allowed_hosts: Vec<String>,
    /// Whether to enable WASI (default: false for security).
    /// When false, modules cannot access env vars, filesystem, or stdio.
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            fuel_limit: 500_000_000,
            call_timeout_secs: 120,
            pool_size: 4,
            allowed_hosts: vec!["*".to_string()],
            wasi_enabled: false,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(64)
                * 1024
                * 1024,
            fuel_limit: std::env::var("PLUGIN_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500_000_000),
            call_timeout_secs: std::env::var("PLUGIN_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            pool_size: std::env::var("PLUGIN_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(4),
            allowed_hosts: std::env::var("PLUGIN_ALLOWED_HOSTS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|h| h.trim().to_string())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["*".to_string()]),
            wasi_enabled: std::env::var("PLUGIN_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Sandbox ────────────────────────────────────────────────────────────

/// A loaded WASM module sandbox.
///
/// Wraps an Extism plugin with memory limits and fuel-based execution
/// limits. Each call gets a fresh fuel budget.
pub struct ExtensionSandbox {
    plugin: extism::Plugin,
    config: SandboxConfig,
    name: String,
}

impl std::fmt::Debug for ExtensionSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionSandbox")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExtensionSandbox {
    /// Instantiate a compiled module.
    ///
    /// Configures memory limits (in 64 KB pages), the allowed HTTP hosts and
    /// the call timeout on the manifest, and fuel limits on the builder.
    pub fn load(module: Vec<u8>, config: SandboxConfig, name: &str) -> Result<Self, SandboxError> {
        let manifest = extism::Manifest::new([extism::Wasm::data(module)])
            .with_memory_max((config.memory_limit / 65536) as u32)
            .with_allowed_hosts(config.allowed_hosts.clone().into_iter())
            .with_timeout(Duration::from_secs(config.call_timeout_secs));

        let builder = extism::PluginBuilder::new(manifest)
            .with_wasi(config.wasi_enabled)
            .with_fuel_limit(config.fuel_limit);

        if config.wasi_enabled {
            tracing::warn!(
                extension = %name,
                "WASI enabled for extension; it can read environment variables"
            );
        }

        let plugin = builder
            .build()
            .map_err(|e| SandboxError::Load(e.to_string()))?;

        Ok(Self {
            plugin,
            config,
            name: name.to_string(),
        })
    }

    /// Call an exported function with raw byte input/output.
    pub fn call(&mut self, function_name: &str, input: &[u8]) -> Result<Vec<u8>, SandboxError> {
        if !self.plugin.function_exists(function_name) {
            return Err(SandboxError::Unsupported(function_name.to_string()));
        }

        tracing::debug!(extension = %self.name, function = %function_name, "calling extension");

        self.plugin
            .call::<&[u8], Vec<u8>>(function_name, input)
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("fuel") {
                    SandboxError::FuelExhausted(self.name.clone())
                } else if msg.contains("memory") {
                    SandboxError::MemoryExceeded(self.name.clone())
                } else if msg.contains("cancel") {
                    SandboxError::Cancelled
                } else {
                    SandboxError::Call(msg)
                }
            })
    }

    /// Call an exported function with JSON-serialized input and output.
    pub fn call_json<I: Serialize, O: DeserializeOwned>(
        &mut self,
        function_name: &str,
        input: &I,
    ) -> Result<O, SandboxError> {
        let json_bytes = serde_json::to_vec(input)?;
        let output_bytes = self.call(function_name, &json_bytes)?;
        let result = serde_json::from_slice(&output_bytes)?;
        Ok(result)
    }

    /// Handle that interrupts the running call from another thread.
    pub fn cancel_handle(&self) -> extism::CancelHandle {
        self.plugin.cancel_handle()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
