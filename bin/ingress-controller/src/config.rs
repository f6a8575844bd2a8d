//! Controller configuration

use anyhow::{Context, Result};
use ingress_core::ProviderConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming the YAML configuration file
pub const CONFIG_ENV: &str = "INGRESS_CONTROLLER_CONFIG";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub log_format: LogFormat,

    /// Where to write every published snapshot as JSON
    #[serde(default)]
    pub output_path: Option<PathBuf>,

    #[serde(flatten)]
    pub provider: ProviderConfig,
}

impl ControllerConfig {
    /// Load from the file named by `INGRESS_CONTROLLER_CONFIG`, or use defaults
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}
