//! Configuration management for voxhook
//!
//! Values come from defaults, then the TOML file, then the environment;
//! later sources win.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::llm::{OpenAiChatConfig, StreamerConfig};
use crate::segmenter::SegmenterConfig;
use crate::source::{DeviceClientConfig, LogTailConfig, RetryPolicy};
use crate::voice::{AudioFormat, OpenAiSpeechConfig, PlaybackConfig, VolumeConfig};
use crate::{Error, Result};

use self::file::VoxhookConfigFile;

/// Default chat and speech API base
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_SYSTEM_PROMPT: &str = "你是一个住在智能音箱里的语音助手，话不多但很聪明。\
需要时先调用工具再回答，用了工具就简单说明。回答要简短、口语化，适合直接朗读，\
不要使用括号、表情或格式标记。";

/// voxhook configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Chat completion endpoint
    pub chat: OpenAiChatConfig,

    /// Speech synthesis endpoint
    pub speech: OpenAiSpeechConfig,

    /// Audio format requested from the synthesizer
    pub format: AudioFormat,

    pub system_prompt: String,

    /// Remembered user/assistant messages
    pub max_history_messages: usize,

    pub streamer: StreamerConfig,

    pub log_tail: LogTailConfig,

    /// Reconnect policy for the recognition feed
    pub retry: RetryPolicy,

    /// Vendor ASR client; `None` when it is started elsewhere
    pub device: Option<DeviceClientConfig>,

    pub segmenter: SegmenterConfig,

    pub playback: PlaybackConfig,

    /// Volume command; `None` disables the volume tool
    pub volume: Option<VolumeConfig>,
}

impl Config {
    /// Load configuration from the TOML file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config path cannot be read or parsed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Ok(Self::from_sources(fc, |name| std::env::var(name).ok()))
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// Empty environment values are ignored.
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(fc: VoxhookConfigFile, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let ms = Duration::from_millis;

        // Chat (env > toml > default)
        let llm = fc.llm;
        let base_url = env("BASE_URL")
            .or(llm.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let chat = OpenAiChatConfig {
            base_url: base_url.clone(),
            api_key: SecretString::from(env("API_KEY").or(llm.api_key).unwrap_or_default()),
            model: env("MODEL_NAME")
                .or(llm.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
        };

        let streamer_defaults = StreamerConfig::default();
        let streamer = StreamerConfig {
            max_tool_rounds: llm
                .max_tool_rounds
                .unwrap_or(streamer_defaults.max_tool_rounds),
            min_chunk_chars: llm
                .min_chunk_chars
                .unwrap_or(streamer_defaults.min_chunk_chars),
            max_chunk_chars: llm
                .max_chunk_chars
                .unwrap_or(streamer_defaults.max_chunk_chars),
        };

        // Speech; base URL and key fall back to the chat endpoint's
        let tts = fc.tts;
        let tts_key = env("TTS_API_KEY")
            .or_else(|| env("DASHSCOPE_API_KEY"))
            .or(tts.api_key)
            .unwrap_or_else(|| chat.api_key.expose_secret().to_string());
        let speech = OpenAiSpeechConfig {
            base_url: env("TTS_BASE_URL").or(tts.base_url).unwrap_or(base_url),
            api_key: SecretString::from(tts_key),
            model: env("TTS_MODEL")
                .or(tts.model)
                .unwrap_or_else(|| "tts-1".to_string()),
            voice: env("TTS_VOICE")
                .or(tts.voice)
                .unwrap_or_else(|| "alloy".to_string()),
            speed: tts.speed.unwrap_or(1.0),
        };

        let format_defaults = AudioFormat::default();
        let format = AudioFormat {
            container: tts.format.unwrap_or(format_defaults.container),
            sample_rate: tts.sample_rate.unwrap_or(format_defaults.sample_rate),
            channels: tts.channels.unwrap_or(format_defaults.channels),
            bit_depth: format_defaults.bit_depth,
        };

        // Recognition feed
        let asr = fc.asr;
        let tail_defaults = LogTailConfig::default();
        let log_tail = LogTailConfig {
            path: env("VOXHOOK_LOG_PATH")
                .or(asr.log_path)
                .map_or(tail_defaults.path, PathBuf::from),
            final_keyword: asr.final_keyword.unwrap_or(tail_defaults.final_keyword),
            partial_keyword: asr.partial_keyword.or(tail_defaults.partial_keyword),
            truncate_on_connect: asr
                .truncate_on_connect
                .unwrap_or(tail_defaults.truncate_on_connect),
            poll_interval: asr.poll_interval_ms.map_or(tail_defaults.poll_interval, ms),
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: asr.max_retries.unwrap_or(retry_defaults.max_retries),
            base_delay: asr.retry_base_ms.map_or(retry_defaults.base_delay, ms),
            max_delay: asr.retry_max_ms.map_or(retry_defaults.max_delay, ms),
        };

        let client_enabled = env("VOXHOOK_DEVICE_CLIENT")
            .map_or(asr.client_enabled, |v| Some(parse_bool(&v)))
            .unwrap_or(true);
        let device = client_enabled.then(|| {
            let defaults = DeviceClientConfig::default();
            DeviceClientConfig {
                program: asr.client_path.map_or(defaults.program, PathBuf::from),
                args: asr.client_args.unwrap_or(defaults.args),
                use_sudo: asr.use_sudo.unwrap_or(defaults.use_sudo),
                asr_timeout_ms: asr.timeout_ms.unwrap_or(defaults.asr_timeout_ms),
                graceful_timeout: defaults.graceful_timeout,
            }
        });

        let segmenter_defaults = SegmenterConfig::default();
        let segmenter = SegmenterConfig {
            debounce: fc
                .segmenter
                .debounce_ms
                .map_or(segmenter_defaults.debounce, ms),
            silence_timeout: fc
                .segmenter
                .silence_timeout_ms
                .map_or(segmenter_defaults.silence_timeout, ms),
        };

        // Audio output
        let pb = fc.playback;
        let playback_defaults = PlaybackConfig::default();
        let playback = PlaybackConfig {
            buffer_ms: pb.buffer_ms.unwrap_or(playback_defaults.buffer_ms),
            poll_interval: pb
                .poll_interval_ms
                .map_or(playback_defaults.poll_interval, ms),
            release_timeout: pb
                .release_timeout_ms
                .map_or(playback_defaults.release_timeout, ms),
            trailing_silence: pb
                .trailing_silence_ms
                .map_or(playback_defaults.trailing_silence, ms),
            queue_capacity: playback_defaults.queue_capacity,
            record_dir: env("VOXHOOK_RECORD_DIR")
                .or(pb.record_dir)
                .map(PathBuf::from),
        };

        let vol = fc.volume;
        let volume_defaults = VolumeConfig::default();
        let volume_command = env("VOXHOOK_VOLUME_COMMAND")
            .or(vol.command)
            .unwrap_or(volume_defaults.command);
        let volume = (!volume_command.trim().is_empty()).then(|| VolumeConfig {
            command: volume_command,
            hw_min: vol.hw_min.unwrap_or(volume_defaults.hw_min),
            hw_max: vol.hw_max.unwrap_or(volume_defaults.hw_max),
            initial_percent: vol.initial_percent.unwrap_or(volume_defaults.initial_percent),
        });

        Self {
            chat,
            speech,
            format,
            system_prompt: env("VOXHOOK_SYSTEM_PROMPT")
                .or(llm.system_prompt)
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_history_messages: llm.max_history.unwrap_or(20),
            streamer,
            log_tail,
            retry,
            device,
            segmenter,
            playback,
            volume,
        }
    }

    /// Check everything the assistant needs before it starts
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.chat.api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "chat API key missing (set API_KEY or llm.api_key)".to_string(),
            ));
        }
        self.validate_speech()?;

        if self.streamer.max_chunk_chars == 0
            || self.streamer.min_chunk_chars > self.streamer.max_chunk_chars
        {
            return Err(Error::Config(format!(
                "invalid chunk limits {}..{}",
                self.streamer.min_chunk_chars, self.streamer.max_chunk_chars
            )));
        }
        if self.log_tail.final_keyword.is_empty() {
            return Err(Error::Config("asr.final_keyword must not be empty".to_string()));
        }

        Ok(())
    }

    /// Check only what speech output needs
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the key is missing or the format is not
    /// playable
    pub fn validate_speech(&self) -> Result<()> {
        if self.speech.api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "TTS API key missing (set TTS_API_KEY, API_KEY or tts.api_key)".to_string(),
            ));
        }
        self.format.validate()
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::voice::AudioContainer;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(VoxhookConfigFile::default(), env_of(&[]));

        assert_eq!(config.chat.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.streamer.max_tool_rounds, 4);
        assert_eq!(config.segmenter.debounce, Duration::from_millis(300));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.playback.release_timeout, Duration::from_millis(200));
        assert_eq!(config.device.as_ref().map(|d| d.asr_timeout_ms), Some(5000));
        assert_eq!(config.volume.as_ref().map(|v| v.hw_max), Some(15));
        assert_eq!(config.max_history_messages, 20);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut fc = VoxhookConfigFile::default();
        fc.llm.model = Some("from-file".to_string());
        fc.llm.api_key = Some("file-key".to_string());
        fc.tts.format = Some(AudioContainer::Wav);

        let config = Config::from_sources(
            fc,
            env_of(&[
                ("MODEL_NAME", "from-env"),
                ("BASE_URL", "http://localhost:8000/v1"),
                ("TTS_VOICE", "nova"),
            ]),
        );

        assert_eq!(config.chat.model, "from-env");
        assert_eq!(config.chat.api_key.expose_secret(), "file-key");
        assert_eq!(config.speech.base_url, "http://localhost:8000/v1");
        assert_eq!(config.speech.api_key.expose_secret(), "file-key");
        assert_eq!(config.speech.voice, "nova");
        assert_eq!(config.format.container, AudioContainer::Wav);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_separate_tts_credentials() {
        let config = Config::from_sources(
            VoxhookConfigFile::default(),
            env_of(&[
                ("API_KEY", "chat-key"),
                ("DASHSCOPE_API_KEY", "tts-key"),
                ("TTS_BASE_URL", "http://tts.local/v1"),
            ]),
        );

        assert_eq!(config.speech.api_key.expose_secret(), "tts-key");
        assert_eq!(config.speech.base_url, "http://tts.local/v1");
        assert_eq!(config.chat.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_empty_env_is_ignored() {
        let mut fc = VoxhookConfigFile::default();
        fc.llm.model = Some("from-file".to_string());

        let config = Config::from_sources(fc, env_of(&[("MODEL_NAME", "  ")]));
        assert_eq!(config.chat.model, "from-file");
    }

    #[test]
    fn test_optional_components() {
        let mut fc = VoxhookConfigFile::default();
        fc.volume.command = Some(String::new());

        let config = Config::from_sources(fc, env_of(&[("VOXHOOK_DEVICE_CLIENT", "off")]));
        assert!(config.volume.is_none());
        assert!(config.device.is_none());
    }

    #[test]
    fn test_opus_rejected() {
        let mut fc = VoxhookConfigFile::default();
        fc.tts.format = Some(AudioContainer::OggOpus);

        let config = Config::from_sources(fc, env_of(&[("API_KEY", "k")]));
        assert!(config.validate_speech().is_err());
    }
}
