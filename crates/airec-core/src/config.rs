use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// ISO-639-1 language tag passed to the speech model.
    #[serde(default = "default_language")]
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArchiveConfig {
    /// When true, finished recordings are also copied to `root`.
    #[serde(default)]
    pub enabled: bool,
    /// Root of the archival target (e.g. a cloud-synced folder).
    #[serde(default)]
    pub root: Option<PathBuf>,
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
        }
    }
}

impl Config {
    /// Get the path to the airec directory (~/.airec)
    pub fn app_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".airec")
    }

    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        Self::app_dir().join("config.toml")
    }

    /// Documents root that recording paths are stored relative to.
    pub fn documents_dir() -> PathBuf {
        Self::app_dir()
    }

    /// Directory that holds captured audio files.
    pub fn recordings_dir() -> PathBuf {
        Self::app_dir().join("recordings")
    }

    /// Directory that holds downloaded model variants.
    pub fn models_dir() -> PathBuf {
        Self::app_dir().join("models")
    }

    /// Check if a config file exists
    pub fn exists() -> bool {
        Self::config_path().exists()
    }

    /// Load config from file
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let content = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }

    /// Load the config, falling back to defaults when none exists.
    pub fn load_or_default() -> Self {
        if Self::exists() {
            Self::load().unwrap_or_default()
        } else {
            Self::default()
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        // Ensure directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;
        fs::write(&path, content)?;
        Ok(())
    }
}
