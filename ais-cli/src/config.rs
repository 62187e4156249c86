//! Configuration file handling for the `ais` binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use headless_ais::AisConfig;

use crate::cli::Args;

const APP_DIR: &str = "headless-ais";

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

fn default_data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join(APP_DIR))
}

/// Load the TOML file at `path` (or the default location), then apply
/// command line overrides.
///
/// A missing file yields the defaults.
pub fn load(args: &Args) -> Result<AisConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = match path.as_deref() {
        Some(path) if path.exists() => read(path)?,
        Some(path) if args.config.is_some() => {
            anyhow::bail!("config file {} does not exist", path.display())
        }
        _ => AisConfig::default(),
    };

    if let Some(base_url) = &args.base_url {
        config.portal.base_url = base_url.clone();
    }
    if let Some(endpoint) = &args.ocr_endpoint {
        config.ocr.endpoint = Some(endpoint.clone());
    }
    fill_vault_paths(&mut config, default_data_dir());
    Ok(config)
}

fn read(path: &Path) -> Result<AisConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

/// Keep the credential on disk unless the file says otherwise.
fn fill_vault_paths(config: &mut AisConfig, data_dir: Option<PathBuf>) {
    let Some(data_dir) = data_dir else {
        return;
    };
    if config.vault.credential_path.is_none() {
        config.vault.credential_path = Some(data_dir.join("credential.json"));
    }
    if config.vault.key_path.is_none() {
        config.vault.key_path = Some(data_dir.join("vault.key"));
    }
}

pub fn show(config: &AisConfig) -> Result<String> {
    toml::to_string_pretty(config).context("serializing config")
}
