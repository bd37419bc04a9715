//! Pipeline configuration.
//!
//! Loaded once at startup from defaults, an optional TOML file and
//! `SPEAKEASY__SECTION__KEY` environment variables, validated, then shared
//! read-only by every stage.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var naming the config file (without it: `config/speakeasy.toml`).
pub const CONFIG_PATH_ENV: &str = "SPEAKEASY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/speakeasy.toml";
const ENV_PREFIX: &str = "SPEAKEASY";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Answer conversationally in short sentences that sound natural when read aloud. Do not use markdown, lists or emoji.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub completion: CompletionConfig,
    pub segmenter: SegmenterConfig,
    pub synthesis: SynthesisConfig,
    pub playback: PlaybackConfig,
    pub pipeline: ChannelConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionProvider {
    /// `/chat/completions` with server-sent events (OpenAI, DeepSeek, gateways).
    #[serde(rename = "openai_compatible", alias = "openai", alias = "deepseek")]
    OpenAiCompatible,
    /// Ollama `/api/chat` with newline-delimited JSON.
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub provider: CompletionProvider,
    pub base_url: String,
    pub model: String,
    /// Falls back to `OPENAI_API_KEY` then `DEEPSEEK_API_KEY`.
    pub api_key: Option<String>,
    pub temperature: f32,
    pub system_prompt: String,
    pub request_timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: CompletionProvider::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "qwen2.5:7b".to_string(),
            api_key: None,
            temperature: 0.7,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            request_timeout_secs: 120,
        }
    }
}

impl CompletionConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Whether spoken-form normalization runs before or after length splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationOrder {
    /// Normalize the sentence, then split: the size limit applies to what is spoken.
    #[default]
    BeforeSplit,
    /// Split the raw sentence, then normalize each piece.
    AfterSplit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub max_chunk_chars: usize,
    pub fast_path_min_chars: usize,
    pub normalize: bool,
    pub normalization_order: NormalizationOrder,
    /// After CLEAR mid-turn, drop the rest of that turn's text and stop
    /// streaming it from the completion service.
    pub mute_rest_of_turn: bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 50,
            fast_path_min_chars: 18,
            normalize: true,
            normalization_order: NormalizationOrder::BeforeSplit,
            mute_rest_of_turn: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsProvider {
    /// Offline tone generator; useful without a speech API.
    Placeholder,
    /// OpenAI-compatible `/audio/speech` returning raw PCM.
    Speech,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub provider: TtsProvider,
    pub workers: usize,
    /// Upper bound on chunks submitted but not yet released.
    pub queue_depth: usize,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Voice used when a new identity file is created.
    pub default_voice: String,
    pub identity_path: PathBuf,
    pub sample_rate: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: TtsProvider::Placeholder,
            workers: 2,
            queue_depth: 8,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            default_voice: "alloy".to_string(),
            identity_path: PathBuf::from("speaker_identity.toml"),
            sample_rate: 24_000,
        }
    }
}

impl SynthesisConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("TTS_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputDevice {
    /// System default output through rodio.
    Default,
    /// Discard audio; playback completes immediately.
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub device: OutputDevice,
    pub poll_interval_ms: u64,
    /// How long STOPPING may wait for the device to go quiet.
    pub stop_timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: OutputDevice::Default,
            poll_interval_ms: 50,
            stop_timeout_ms: 500,
        }
    }
}

impl PlaybackConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub channel_capacity: usize,
    pub command_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
            command_capacity: 16,
        }
    }
}

impl PipelineConfig {
    /// Load from `SPEAKEASY_CONFIG` (or `config/speakeasy.toml`) plus env overrides.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder()
            .set_default("completion.provider", "ollama")?
            .set_default("synthesis.provider", "placeholder")?
            .set_default("playback.device", "default")?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: PipelineConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        let seg = &self.segmenter;
        if seg.max_chunk_chars == 0 {
            return Err(VoiceError::Config("segmenter.max_chunk_chars must be at least 1".into()));
        }
        if seg.fast_path_min_chars == 0 || seg.fast_path_min_chars > seg.max_chunk_chars {
            return Err(VoiceError::Config(format!(
                "segmenter.fast_path_min_chars ({}) must be between 1 and max_chunk_chars ({})",
                seg.fast_path_min_chars, seg.max_chunk_chars
            )));
        }
        if self.synthesis.workers == 0 {
            return Err(VoiceError::Config("synthesis.workers must be at least 1".into()));
        }
        if self.synthesis.queue_depth < self.synthesis.workers {
            return Err(VoiceError::Config(format!(
                "synthesis.queue_depth ({}) must be at least synthesis.workers ({})",
                self.synthesis.queue_depth, self.synthesis.workers
            )));
        }
        if self.synthesis.sample_rate == 0 {
            return Err(VoiceError::Config("synthesis.sample_rate must be positive".into()));
        }
        if !(1..=100).contains(&self.playback.poll_interval_ms) {
            return Err(VoiceError::Config(format!(
                "playback.poll_interval_ms ({}) must be within 1..=100",
                self.playback.poll_interval_ms
            )));
        }
        if self.pipeline.channel_capacity == 0 || self.pipeline.command_capacity == 0 {
            return Err(VoiceError::Config("pipeline channel capacities must be positive".into()));
        }
        if !(0.0..=2.0).contains(&self.completion.temperature) {
            return Err(VoiceError::Config(format!(
                "completion.temperature ({}) must be within 0.0..=2.0",
                self.completion.temperature
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.segmenter.max_chunk_chars, 50);
        assert_eq!(config.segmenter.fast_path_min_chars, 18);
        assert_eq!(config.synthesis.workers, 2);
        assert_eq!(config.playback.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.synthesis.sample_rate, 24_000);
    }

    #[test]
    fn rejects_zero_workers_and_slow_polling() {
        let mut config = PipelineConfig::default();
        config.synthesis.workers = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.playback.poll_interval_ms = 250;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.segmenter.fast_path_min_chars = 80;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[completion]
provider = "deepseek"
model = "deepseek-chat"

[segmenter]
max_chunk_chars = 40
normalization_order = "after_split"

[playback]
device = "null"
"#
        )
        .unwrap();

        let config = PipelineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.completion.provider, CompletionProvider::OpenAiCompatible);
        assert_eq!(config.completion.model, "deepseek-chat");
        assert_eq!(config.segmenter.max_chunk_chars, 40);
        assert_eq!(config.segmenter.normalization_order, NormalizationOrder::AfterSplit);
        assert_eq!(config.segmenter.fast_path_min_chars, 18);
        assert_eq!(config.playback.device, OutputDevice::Null);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = PipelineConfig::load_from(Path::new("does/not/exist.toml")).unwrap();
        assert_eq!(config.completion.provider, CompletionProvider::Ollama);
    }
}
