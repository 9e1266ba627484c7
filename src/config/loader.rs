//! Configuration file loading.
//!
//! The loader is deliberately strict: the file format is chosen by
//! extension, and an extension it does not recognize is a startup error
//! rather than a silent guess. Everything here is synchronous; reading a
//! config file happens at startup and on reload, never on the hot path.
use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{bail, Context, Result};

use crate::config::models::GatewayConfig;

/// Configuration file formats the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    /// Detect the format from the file extension. A typo like
    /// `gateway.tmol` fails loudly here instead of parsing as the wrong
    /// format later.
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            Some("toml") => Ok(Self::Toml),
            Some(other) => bail!(
                "unsupported config format '.{other}' for {}; expected .yaml, .yml, .json or .toml",
                path.display()
            ),
            None => bail!(
                "config path {} has no file extension to detect a format from",
                path.display()
            ),
        }
    }

    fn as_file_format(self) -> FileFormat {
        match self {
            Self::Yaml => FileFormat::Yaml,
            Self::Json => FileFormat::Json,
            Self::Toml => FileFormat::Toml,
        }
    }
}

/// Read and deserialize a gateway configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<GatewayConfig> {
    let path = path.as_ref();
    let format = ConfigFormat::from_path(path)?;
    let path_str = path
        .to_str()
        .ok_or_else(|| eyre::eyre!("config path {} is not valid UTF-8", path.display()))?;

    Config::builder()
        .add_source(File::new(path_str, format.as_file_format()))
        .build()
        .and_then(|settings| settings.try_deserialize())
        .with_context(|| format!("cannot load gateway config from {}", path.display()))
}
