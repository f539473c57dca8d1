//! Pipeline settings as operator-tunable TOML values.
//!
//! Each struct implements `Default` with values matching the original
//! hardcoded constants, ensuring zero-change behavior when no config file
//! is present.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a scanforge deployment.
///
/// Load with `PipelineConfig::load()` which searches:
/// 1. `$SCANFORGE_CONFIG` env var
/// 2. `./scanforge.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Storage locations and model naming
    #[serde(default)]
    pub storage: StorageConfig,

    /// Capture session tuning
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Upload endpoint configuration
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            capture: CaptureConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

/// Storage locations and model naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root documents directory for staged shots and model output
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Generate `model-<uuid>.usdz` instead of a fixed `model.usdz`
    #[serde(default)]
    pub unique_model_names: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            unique_model_names: false,
        }
    }
}

/// Capture session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Minimum shots required before a capture pass counts as usable
    #[serde(default = "default_min_shots")]
    pub min_shots: u32,

    /// Maximum shots a session will take
    #[serde(default = "default_max_shots")]
    pub max_shots: u32,

    /// Scripted engine: milliseconds between simulated shots
    #[serde(default = "default_shot_interval_ms")]
    pub shot_interval_ms: u64,
}

fn default_min_shots() -> u32 {
    10
}

fn default_max_shots() -> u32 {
    100
}

fn default_shot_interval_ms() -> u64 {
    40
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_shots: default_min_shots(),
            max_shots: default_max_shots(),
            shot_interval_ms: default_shot_interval_ms(),
        }
    }
}

/// Upload endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Full URL of the collection server's upload route
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8000/upload-model".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl PipelineConfig {
    /// Load configuration using the standard search order:
    /// 1. `$SCANFORGE_CONFIG` environment variable
    /// 2. `./scanforge.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("SCANFORGE_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded pipeline config from SCANFORGE_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from SCANFORGE_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "SCANFORGE_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("scanforge.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded pipeline config from ./scanforge.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./scanforge.toml, using defaults");
                }
            }
        }

        info!("No scanforge.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
