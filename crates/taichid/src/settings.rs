//! Daemon settings file
//!
//! ```toml
//! [server]
//! address = "0.0.0.0"
//! port = 80
//! grace_period_secs = 10
//!
//! [terminal]
//! shell = "bash"
//!
//! [monitor]
//! interval_ms = 1000
//! ```
//!
//! Every table and field is optional.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use taichi_apps::{MonitorSettings, TerminalSettings};
use taichi_gateway::ServerSettings;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub server: ServerSettings,
    pub terminal: TerminalSettings,
    pub monitor: MonitorSettings,
}

impl DaemonSettings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file '{}'", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file '{}'", path.display()))
    }
}

/// Command-line values that take precedence over the settings file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub grace_period_secs: Option<u64>,
    pub shell: Option<String>,
}

impl Overrides {
    pub fn apply(self, settings: &mut DaemonSettings) {
        if let Some(address) = self.address {
            settings.server.address = address;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(grace) = self.grace_period_secs {
            settings.server.grace_period_secs = grace;
        }
        if let Some(shell) = self.shell {
            settings.terminal.shell = shell;
        }
    }
}

/// Resolve the configuration store path, defaulting to the executable's
/// directory.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(taichi_config::ConfigStore::default_path)
}
