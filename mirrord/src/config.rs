//! uxmirror daemon configuration loading and parsing

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "UXMIRROR_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub uxplay: UxplayConfig,
    #[serde(default = "default_receivers")]
    pub receivers: Vec<ReceiverConfig>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            uxplay: UxplayConfig::default(),
            receivers: default_receivers(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            stop_timeout_seconds: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct UxplayConfig {
    /// Path or command name; empty means auto-detect
    #[serde(default)]
    pub binary: String,
}

/// One receiver the front end knows about
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReceiverConfig {
    pub label: String,
    pub airplay_name: String,
    pub base_port: u16,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl ReceiverConfig {
    fn new(label: &str, airplay_name: &str, base_port: u16) -> Self {
        Self {
            label: label.into(),
            airplay_name: airplay_name.into(),
            base_port,
            extra_args: Vec::new(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String { "127.0.0.1:8787".into() }
fn default_log_level() -> String { "info".into() }
fn default_stop_timeout() -> u64 { 5 }
fn default_receivers() -> Vec<ReceiverConfig> {
    vec![
        ReceiverConfig::new("ipad", "iPadMirror", 7000),
        ReceiverConfig::new("iphone", "iPhoneMirror", 7100),
    ]
}

impl MirrorConfig {
    pub fn receiver(&self, label: &str) -> Option<&ReceiverConfig> {
        self.receivers.iter().find(|r| r.label == label)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.stop_timeout_seconds)
    }

    /// The configured receiver binary, auto-detected when left empty
    pub fn receiver_binary(&self) -> String {
        let configured = self.uxplay.binary.trim();
        if configured.is_empty() {
            uxmirror_registry::auto_detect()
        } else {
            configured.to_string()
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for receiver in &self.receivers {
            if receiver.label.is_empty() {
                bail!("Receiver label must not be empty");
            }
            if !seen.insert(receiver.label.as_str()) {
                bail!("Duplicate receiver label '{}'", receiver.label);
            }
            if let Err(e) = uxmirror_registry::validate_port(receiver.base_port) {
                bail!("Receiver '{}': {e}", receiver.label);
            }
        }
        if self.daemon.stop_timeout_seconds == 0 {
            bail!("daemon.stop_timeout_seconds must be at least 1");
        }
        Ok(())
    }
}

/// Config file location: `$UXMIRROR_CONFIG`, else `<config dir>/uxmirror/config.toml`
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("uxmirror")
        .join("config.toml")
}

pub fn parse_config(content: &str) -> Result<MirrorConfig> {
    let config: MirrorConfig = toml::from_str(content).context("Invalid config TOML")?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from `path`, falling back to defaults when it is absent
pub fn load_config(path: &Path) -> Result<MirrorConfig> {
    if !path.exists() {
        return Ok(MirrorConfig::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Failed to parse config from {}", path.display()))
}
