//! CLI configuration: the saved auth token and broker address, stored in
//! `~/.burrow/config.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Token saved by `burrow auth`.
    pub token: Option<String>,

    /// Broker override saved alongside the token.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub broker_addr: Option<String>,
}

pub struct ConfigManager;

impl ConfigManager {
    fn config_path() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("BURROW_CONFIG_DIR") {
            return Ok(PathBuf::from(dir).join("config.json"));
        }
        let home = dirs::home_dir().context("failed to determine home directory")?;
        Ok(home.join(".burrow").join("config.json"))
    }

    pub fn load() -> Result<CliConfig> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(CliConfig::default());
        }

        let json = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        serde_json::from_str(&json)
            .with_context(|| format!("failed to parse config file {:?}", path))
    }

    pub fn save(config: &CliConfig) -> Result<PathBuf> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write config file {:?}", path))?;
        Ok(path)
    }

    pub fn save_token(token: String) -> Result<PathBuf> {
        let mut config = Self::load()?;
        config.token = Some(token);
        Self::save(&config)
    }
}
