//! Configuration file loading for the playout binary
//!
//! The library itself is configured programmatically (settings provider);
//! this TOML file only feeds the `sara-playout` CLI.

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Playout binary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayoutConfig {
    /// Default fade applied when an item carries no segue/overlap markers
    #[serde(default = "default_fade_seconds")]
    pub fade_seconds: f64,

    /// PFL monitor device name, if configured
    #[serde(default)]
    pub pfl_device: Option<String>,

    /// Extensions eligible for the transcode-to-WAV fallback
    #[serde(default = "default_transcode_extensions")]
    pub transcode_extensions: Vec<String>,

    /// Remove items from the playlist once played
    #[serde(default)]
    pub auto_remove_played: bool,
}

fn default_fade_seconds() -> f64 {
    3.0
}

fn default_transcode_extensions() -> Vec<String> {
    ["m4a", "mp4", "wma", "aiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            fade_seconds: default_fade_seconds(),
            pfl_device: None,
            transcode_extensions: default_transcode_extensions(),
            auto_remove_played: false,
        }
    }
}

impl PlayoutConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| CommonError::Config(format!("{}: {}", path.display(), e)))
    }
}
