//! Driver configuration file.
//!
//! Values come from command-line flags first, then
//! `~/.config/mixattn/config.toml`, then the built-in defaults.

use std::fs;
use std::path::{Path, PathBuf};

use mixattn_core::AttentionConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// On-disk driver settings; every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Head size of the synthetic KV cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_size: Option<usize>,

    /// Tokens per cache block (also the linear cache granularity).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_block: Option<usize>,

    /// Block-pointer table width per sequence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_blocks_per_sequence: Option<usize>,

    /// Seed for synthetic activations and lengths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Engine configuration; omitted fields take the engine defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<AttentionConfig>,
}

/// Fully resolved driver settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub engine: AttentionConfig,
    pub head_size: usize,
    pub tokens_per_block: usize,
    pub max_blocks_per_sequence: usize,
    pub seed: u64,
}

impl DriverSettings {
    /// Token positions each sequence can hold.
    pub fn cache_capacity(&self) -> usize {
        self.tokens_per_block * self.max_blocks_per_sequence
    }
}

impl DriverConfig {
    /// `<config dir>/mixattn/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mixattn").join("config.toml"))
    }

    /// The user config, or an empty config when it is missing or unreadable.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }

    /// Write to `path`, creating missing parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let encoded = toml::to_string_pretty(self)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Overlay the fields `other` sets.
    pub fn merge(&mut self, other: &DriverConfig) {
        if other.engine.is_some() {
            self.engine = other.engine.clone();
        }
        if other.head_size.is_some() {
            self.head_size = other.head_size;
        }
        if other.tokens_per_block.is_some() {
            self.tokens_per_block = other.tokens_per_block;
        }
        if other.max_blocks_per_sequence.is_some() {
            self.max_blocks_per_sequence = other.max_blocks_per_sequence;
        }
        if other.seed.is_some() {
            self.seed = other.seed;
        }
    }

    /// Fill unset values with defaults.
    pub fn resolve(&self) -> DriverSettings {
        DriverSettings {
            engine: self.engine.clone().unwrap_or_default(),
            head_size: self.head_size.unwrap_or(64),
            tokens_per_block: self.tokens_per_block.unwrap_or(16),
            max_blocks_per_sequence: self.max_blocks_per_sequence.unwrap_or(8),
            seed: self.seed.unwrap_or(0),
        }
    }

    /// The config written by `mixattn config dump`.
    pub fn with_defaults() -> Self {
        let settings = DriverConfig::default().resolve();
        Self {
            engine: Some(settings.engine),
            head_size: Some(settings.head_size),
            tokens_per_block: Some(settings.tokens_per_block),
            max_blocks_per_sequence: Some(settings.max_blocks_per_sequence),
            seed: Some(settings.seed),
        }
    }
}

/// Failure to read or write the driver config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config could not be encoded as TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}
