//! User configuration, persisted as JSON.

use std::path::PathBuf;

use magic_core::MagicFlags;
use serde::{Deserialize, Serialize};

/// Defaults applied when the command line does not say otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Databases to load when neither `-m` nor `$MAGIC` is given.
    #[serde(default)]
    pub magic_paths: Vec<PathBuf>,
    /// Categories always excluded, as accepted by `--exclude`.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Bytes inspected per file (unset = library default).
    #[serde(default)]
    pub bytes_max: Option<usize>,
    #[serde(default)]
    pub brief: bool,
}

impl AppConfig {
    /// Platform config directory: `~/.config/filemagic/`
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("filemagic")
    }

    fn config_file() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load from disk, or return defaults if the file doesn't exist.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::config_file();
        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&data)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir();
        std::fs::create_dir_all(&dir)?;
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::config_file(), data)?;
        Ok(())
    }

    /// Update one key from its textual form.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "magic_paths" => {
                self.magic_paths = std::env::split_paths(value)
                    .filter(|p| !p.as_os_str().is_empty())
                    .collect();
            }
            "exclude" => {
                let names: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                if let Some(bad) = names.iter().find(|n| MagicFlags::from_exclude(n).is_none()) {
                    anyhow::bail!("Unknown test name: {bad}");
                }
                self.exclude = names;
            }
            "bytes_max" => {
                self.bytes_max = match value {
                    "" | "none" => None,
                    n => Some(n.parse()?),
                };
            }
            "brief" => self.brief = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {key}"),
        }
        Ok(())
    }
}
