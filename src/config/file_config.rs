use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Optional TOML overrides. Secrets are deliberately absent: they only come from
/// the command line or the environment.
#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub store_path: Option<String>,
    pub timeout_ms: Option<u64>,
    pub scope: Option<String>,
    pub admin_user: Option<String>,
    pub app_user: Option<String>,
    pub strict_principals: Option<bool>,
    pub reap_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
