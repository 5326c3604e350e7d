use std::path::{Path, PathBuf};

use relaydesk_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const DIR_NAME: &str = "relaydesk";

/// On-disk config formats, in lookup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    const LOOKUP_ORDER: [ConfigFormat; 2] = [ConfigFormat::Yaml, ConfigFormat::Toml];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Yaml => "config.yml",
            Self::Toml => "config.toml",
        }
    }

    fn parse(self, contents: &str) -> Result<AppConfig> {
        let parsed = match self {
            Self::Yaml => serde_yaml::from_str(contents).map_err(|e| e.to_string()),
            Self::Toml => toml::from_str(contents).map_err(|e| e.to_string()),
        };
        parsed.map_err(|e| Error::Config(format!("failed to parse {self:?} config: {e}")))
    }
}

/// Finds and reads `config.yml` / `config.toml` under one directory.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Result<Self> {
        Ok(Self::with_dir(Self::default_config_dir()))
    }

    /// `$XDG_CONFIG_HOME/relaydesk` unless only a legacy `~/.relaydesk`
    /// exists. New installs get the XDG location.
    pub fn default_config_dir() -> PathBuf {
        let xdg = dirs::config_dir().map(|c| c.join(DIR_NAME));
        let legacy = dirs::home_dir().map(|h| h.join(format!(".{DIR_NAME}")));

        [&xdg, &legacy]
            .into_iter()
            .flatten()
            .find(|dir| dir.exists())
            .or(xdg.as_ref())
            .or(legacy.as_ref())
            .cloned()
            .unwrap_or_else(|| PathBuf::from(format!(".{DIR_NAME}")))
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// First config file present on disk, YAML before TOML.
    pub fn locate(&self) -> Option<(PathBuf, ConfigFormat)> {
        ConfigFormat::LOOKUP_ORDER.into_iter().find_map(|format| {
            let path = self.config_dir.join(format.file_name());
            path.is_file().then_some((path, format))
        })
    }

    pub fn config_file_exists(&self) -> bool {
        self.locate().is_some()
    }

    pub fn load(&self) -> Result<AppConfig> {
        let mut config = match self.locate() {
            Some((path, format)) => {
                info!("loading config from {}", path.display());
                format.parse(&std::fs::read_to_string(&path)?)?
            }
            None => {
                info!(
                    "no config file in {}, using defaults",
                    self.config_dir.display()
                );
                AppConfig::default()
            }
        };

        config.storage.data_dir.get_or_insert_with(|| self.data_dir());
        Ok(config)
    }

    /// Default location of the shared and per-tenant databases.
    pub fn data_dir(&self) -> PathBuf {
        self.config_dir.join("data")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let tenants = self.data_dir().join("tenants");
        if !tenants.is_dir() {
            debug!("creating {}", tenants.display());
            // Creates the config and data dirs on the way.
            std::fs::create_dir_all(&tenants)?;
        }
        Ok(())
    }
}
