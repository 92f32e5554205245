//! TOML configuration file loading
//!
//! Supports `~/.config/voxhook/config.toml` as a persistent config source.
//! Every field is optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;
use crate::voice::AudioContainer;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoxhookConfigFile {
    #[serde(default)]
    pub llm: LlmFileConfig,

    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Recognition feed and device client
    #[serde(default)]
    pub asr: AsrFileConfig,

    #[serde(default)]
    pub segmenter: SegmenterFileConfig,

    #[serde(default)]
    pub playback: PlaybackFileConfig,

    #[serde(default)]
    pub volume: VolumeFileConfig,
}

/// Chat model configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmFileConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    /// Remembered user/assistant messages
    pub max_history: Option<usize>,
    pub max_tool_rounds: Option<u32>,
    pub min_chunk_chars: Option<usize>,
    pub max_chunk_chars: Option<usize>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TtsFileConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub format: Option<AudioContainer>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// Recognition feed and vendor client configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsrFileConfig {
    pub log_path: Option<String>,
    pub final_keyword: Option<String>,
    pub partial_keyword: Option<String>,
    pub truncate_on_connect: Option<bool>,
    pub poll_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_base_ms: Option<u64>,
    pub retry_max_ms: Option<u64>,
    /// Spawn the vendor client at startup
    pub client_enabled: Option<bool>,
    pub client_path: Option<String>,
    pub client_args: Option<Vec<String>>,
    pub use_sudo: Option<bool>,
    pub timeout_ms: Option<u64>,
}

/// Query segmentation timing
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmenterFileConfig {
    pub debounce_ms: Option<u64>,
    pub silence_timeout_ms: Option<u64>,
}

/// Audio output configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaybackFileConfig {
    pub buffer_ms: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub release_timeout_ms: Option<u64>,
    pub trailing_silence_ms: Option<u64>,
    pub record_dir: Option<String>,
}

/// Volume command configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeFileConfig {
    /// Command template with a `{level}` placeholder; empty disables volume
    pub command: Option<String>,
    pub hw_min: Option<u32>,
    pub hw_max: Option<u32>,
    pub initial_percent: Option<u8>,
}

/// Load the TOML config file
///
/// An explicit `path` must exist and parse. Without one, the standard path
/// is tried and a missing or broken file falls back to defaults.
///
/// # Errors
///
/// Returns error if an explicit path cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<VoxhookConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(VoxhookConfigFile::default());
    };

    if !path.exists() {
        return Ok(VoxhookConfigFile::default());
    }

    let config = match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoxhookConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoxhookConfigFile::default()
        }
    };

    Ok(config)
}

/// Return the config file path: `~/.config/voxhook/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voxhook").join("config.toml"))
}
