// knhk-registry: Configuration support

use crate::error::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};

/// Registry configuration: defaults, overridable by a TOML file, itself
/// overridable by environment variables (see `main.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub server: ServerConfigSection,
    pub idle: IdleConfigSection,
    pub ack: AckConfigSection,
    pub wheel: WheelConfigSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigSection {
    pub bind_address: String,
    pub so_backlog: i32,
}

/// Reader-idle is enabled by default; writer/all-idle are disabled unless
/// explicitly configured (the server's own default idle-detection policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfigSection {
    pub reader_idle_seconds: u64,
    pub writer_idle_seconds: u64,
    pub all_idle_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckConfigSection {
    pub scan_interval_ms: u64,
    pub ack_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WheelConfigSection {
    pub tick_ms: u64,
    pub wheel_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            server: ServerConfigSection {
                bind_address: "0.0.0.0:9527".to_string(),
                so_backlog: 1024,
            },
            idle: IdleConfigSection {
                reader_idle_seconds: 90,
                writer_idle_seconds: 0,
                all_idle_seconds: 0,
            },
            ack: AckConfigSection {
                scan_interval_ms: 300,
                ack_timeout_ms: 10_000,
            },
            wheel: WheelConfigSection {
                tick_ms: 100,
                wheel_size: 512,
            },
        }
    }
}

impl RegistryConfig {
    /// Load from a TOML file, falling back to defaults for any section the
    /// file omits (`#[serde(default)]` isn't set on the sections since the
    /// teacher's `SidecarConfig::from_file` expects a complete document;
    /// this mirrors that contract).
    pub fn from_file(path: &str) -> RegistryResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::ConfigError(format!("failed to read config file {path}: {e}")))?;
        toml::from_str(&content).map_err(|e| RegistryError::ConfigError(format!("failed to parse config file: {e}")))
    }

    /// Apply environment-variable overrides on top of a loaded/default
    /// config, matching `knhk-sidecar::main`'s `env::var(...).unwrap_or_else`
    /// layering.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("REGISTRY_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Ok(v) = std::env::var("REGISTRY_READER_IDLE_SECONDS").and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent)) {
            self.idle.reader_idle_seconds = v;
        }
        if let Ok(v) = std::env::var("REGISTRY_ACK_TIMEOUT_MS").and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent)) {
            self.ack.ack_timeout_ms = v;
        }
        self
    }

    pub fn reader_idle(&self) -> Option<std::time::Duration> {
        (self.idle.reader_idle_seconds > 0).then(|| std::time::Duration::from_secs(self.idle.reader_idle_seconds))
    }

    pub fn writer_idle(&self) -> Option<std::time::Duration> {
        (self.idle.writer_idle_seconds > 0).then(|| std::time::Duration::from_secs(self.idle.writer_idle_seconds))
    }

    pub fn all_idle(&self) -> Option<std::time::Duration> {
        (self.idle.all_idle_seconds > 0).then(|| std::time::Duration::from_secs(self.idle.all_idle_seconds))
    }
}
