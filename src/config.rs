//! Agent Configuration
//!
//! Loads and saves the agent's configuration from `~/.claw/config.json`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::types::{default_config, AgentConfig};

/// Config file name within the agent directory.
const CONFIG_FILENAME: &str = "config.json";

/// Returns the agent's state directory, honoring the default `~/.claw`.
pub fn get_agent_dir() -> PathBuf {
    PathBuf::from(resolve_path(&default_config().storage_dir))
}

/// Returns the full path to the agent config file: `~/.claw/config.json`.
pub fn get_config_path() -> PathBuf {
    get_agent_dir().join(CONFIG_FILENAME)
}

/// Load the agent config from disk, merging defaults for unset fields.
///
/// Returns `None` if the config file does not exist or cannot be parsed.
pub fn load_config() -> Option<AgentConfig> {
    let config_path = get_config_path();
    if !config_path.exists() {
        return None;
    }

    let contents = fs::read_to_string(&config_path).ok()?;
    let mut config: AgentConfig = serde_json::from_str(&contents).ok()?;

    // Merge defaults for unset fields
    let defaults = default_config();

    if config.model.is_empty() {
        config.model = defaults.model;
    }
    if config.storage_dir.is_empty() {
        config.storage_dir = defaults.storage_dir;
    }
    if config.default_timezone.is_empty() {
        config.default_timezone = defaults.default_timezone;
    }
    if config.alarm_tick_secs == 0 {
        config.alarm_tick_secs = defaults.alarm_tick_secs;
    }
    if config.reasoning_command.is_empty() {
        config.reasoning_command = defaults.reasoning_command;
    }
    if config.reasoning_timeout_secs == 0 {
        config.reasoning_timeout_secs = defaults.reasoning_timeout_secs;
    }
    if config.version.is_empty() {
        config.version = defaults.version;
    }

    Some(config)
}

/// Save the agent config to disk, creating the directory if needed.
pub fn save_config(config: &AgentConfig) -> Result<()> {
    let dir = PathBuf::from(resolve_path(&config.storage_dir));
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create agent directory")?;
    }

    let config_path = dir.join(CONFIG_FILENAME);
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(&config_path, &json).context("Failed to write config file")?;

    Ok(())
}

/// Resolve a path that may start with `~` to an absolute path.
///
/// If the path starts with `~`, the tilde is replaced with the user's home
/// directory. Otherwise the path is returned as-is.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}
