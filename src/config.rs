//! Configuration for mailferry.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line flags (applied by the CLI)
//! 2. Environment variables (MAILFERRY_BATCH_SIZE, MAILFERRY_CAPACITY)
//! 3. Config file (.mailferry/config.yaml)
//! 4. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .mailferry/config.yaml
//! - Falls back to <user config dir>/mailferry/config.yaml

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::orchestrator::DEFAULT_PERSIST_EVERY;
use crate::core::{FolderSettings, Namespace, TrackerSettings};

/// Overrides `pipeline.persist_every`
pub const ENV_BATCH_SIZE: &str = "MAILFERRY_BATCH_SIZE";

/// Overrides `tracker.capacity`
pub const ENV_CAPACITY: &str = "MAILFERRY_CAPACITY";

const CONFIG_DIR: &str = ".mailferry";
const CONFIG_NAME: &str = "config.yaml";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tracker: TrackerSettings,
    pub pipeline: PipelineSettings,
    pub folders: FolderSettings,
    pub namespace: Namespace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Deliveries between progress saves
    pub persist_every: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            persist_every: DEFAULT_PERSIST_EVERY,
        }
    }
}

/// Settings after all sources are applied
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub settings: Settings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_NAME);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Per-user config file, if present
fn user_config_file() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("mailferry").join(CONFIG_NAME);
    path.exists().then_some(path)
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    if content.trim().is_empty() {
        return Ok(Settings::default());
    }

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Apply environment overrides using `lookup` to read variables
fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_BATCH_SIZE) {
        settings.pipeline.persist_every = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: '{}'", ENV_BATCH_SIZE, value))?;
    }

    if let Some(value) = lookup(ENV_CAPACITY) {
        settings.tracker.capacity = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: '{}'", ENV_CAPACITY, value))?;
    }

    Ok(())
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config_file = find_config_file(&cwd).or_else(user_config_file);

    let mut settings = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => Settings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;

    Ok(ResolvedConfig {
        settings,
        config_file,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
