//! Initialize the configuration directory: create `~/.rcs-probe` and a template `config.json`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Template written by `rcs-probe init`: every section present with defaults, backend URL and
/// device token left empty for the user to fill in.
pub fn template_config() -> Config {
    let mut config = Config::default();
    config.backend.base_url = Some(String::new());
    config.device.fcm_token = Some(String::new());
    config
}

/// Create the config directory and a template config file if it does not exist.
/// An existing config file is never overwritten. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let body = serde_json::to_string_pretty(&template_config())
            .context("serializing template config")?;
        std::fs::write(config_path, body)
            .with_context(|| format!("writing template config to {}", config_path.display()))?;
        log::info!("created template config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}
