//! Configuration management for salu-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (SALU_PROGRAM, SALU_SCENARIO, SALU_WORKERS)
//! 2. Project-local config file (`./salu-emu.toml`)
//! 3. User config file (`~/.config/salu-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # salu-emu.toml
//!
//! # Program used when a scenario or command does not name one
//! program_path = "demos/load_balancer.toml"
//!
//! # Worker threads for packet bursts
//! workers = 4
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Project-local config file, relative to the working directory.
const LOCAL_CONFIG: &str = "salu-emu.toml";

/// Default worker count for packet bursts.
pub const DEFAULT_WORKERS: usize = 4;

/// salu-emu configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Program description to load when none is given.
    pub program_path: Option<String>,

    /// Scenario to run when none is given.
    pub scenario_path: Option<String>,

    /// Worker threads for packet bursts.
    pub workers: Option<usize>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Layers are applied lowest priority first: the user config, then
    /// `./salu-emu.toml`, then environment variables.
    pub fn load() -> Self {
        let layers = [Self::user_config_path(), Some(PathBuf::from(LOCAL_CONFIG))];
        let mut config = layers
            .into_iter()
            .flatten()
            .filter_map(|path| Self::read_layer(&path))
            .fold(Self::default(), |mut acc, layer| {
                acc.merge(layer);
                acc
            });
        config.apply_env_overrides();
        config
    }

    /// Get the cached global configuration.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("effective configuration: {:?}", config);
            config
        })
    }

    /// Parse one configuration layer from TOML text.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Worker count, with fallback to [`DEFAULT_WORKERS`].
    pub fn workers(&self) -> usize {
        self.workers.filter(|&n| n > 0).unwrap_or(DEFAULT_WORKERS)
    }

    /// Configured program path, if any.
    pub fn program_path(&self) -> Option<PathBuf> {
        self.program_path.as_ref().map(PathBuf::from)
    }

    /// Configured scenario path, if any.
    pub fn scenario_path(&self) -> Option<PathBuf> {
        self.scenario_path.as_ref().map(PathBuf::from)
    }

    /// A missing file is silently skipped; an unreadable or malformed one
    /// is skipped with a warning.
    fn read_layer(path: &Path) -> Option<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("skipping config {}: {}", path.display(), e);
                return None;
            }
        };
        match Self::parse(&text) {
            Ok(layer) => {
                log::info!("config layer {}", path.display());
                Some(layer)
            }
            Err(e) => {
                log::warn!("skipping config {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Only fields that are Some in `other` override.
    fn merge(&mut self, other: Self) {
        if other.program_path.is_some() {
            self.program_path = other.program_path;
        }
        if other.scenario_path.is_some() {
            self.scenario_path = other.scenario_path;
        }
        if other.workers.is_some() {
            self.workers = other.workers;
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("SALU_PROGRAM") {
            log::info!("Using SALU_PROGRAM from environment: {}", path);
            self.program_path = Some(path);
        }
        if let Some(path) = var("SALU_SCENARIO") {
            log::info!("Using SALU_SCENARIO from environment: {}", path);
            self.scenario_path = Some(path);
        }
        if let Some(workers) = var("SALU_WORKERS") {
            match workers.trim().parse() {
                Ok(n) => self.workers = Some(n),
                Err(_) => log::warn!("Ignoring invalid SALU_WORKERS '{}'", workers),
            }
        }
    }

    /// Path of the user config file, if the platform has a config directory.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("salu-emu").join("config.toml"))
    }

    /// Commented sample config file.
    pub fn sample_config() -> String {
        r#"# salu-emu configuration
# Place this file at ~/.config/salu-emu/config.toml or ./salu-emu.toml

# Program description used by `inspect` and by scenarios that omit one
# program_path = "demos/load_balancer.toml"

# Scenario used by `run` when none is given
# scenario_path = "demos/load_balancer_scenario.toml"

# Worker threads for packet bursts (default 4)
workers = 4
"#
        .to_string()
    }
}
