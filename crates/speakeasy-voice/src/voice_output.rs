//! **VoiceOutput**: speech synthesis backends and the audio output device.
//!
//! Synthesis is a blocking call (`TtsBackend`) that the scheduler runs on
//! the blocking pool. Playback goes through `AudioDevice`: start a buffer,
//! poll whether it is still sounding, stop it on CLEAR.

use crate::config::{SynthesisConfig, TtsProvider};
use crate::error::{VoiceError, VoiceResult};
use crate::identity::VoiceIdentity;
use crate::message::AudioBuffer;
use once_cell::sync::OnceCell;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Turns text into a waveform. Called from several blocking threads at
/// once, up to the configured worker count.
pub trait TtsBackend: Send + Sync {
    fn synthesize(&self, text: &str) -> VoiceResult<AudioBuffer>;

    fn name(&self) -> &str {
        "tts"
    }
}

/// Build the backend named by the config, speaking as `identity`.
pub fn create_tts_backend(
    config: &SynthesisConfig,
    identity: Arc<VoiceIdentity>,
) -> VoiceResult<Arc<dyn TtsBackend>> {
    let backend: Arc<dyn TtsBackend> = match config.provider {
        TtsProvider::Placeholder => Arc::new(PlaceholderTts::new(identity, config.sample_rate)),
        TtsProvider::Speech => Arc::new(SpeechApiTts::from_config(config, identity)?),
    };
    info!(backend = backend.name(), "TTS backend ready");
    Ok(backend)
}

/// Offline stand-in: a quiet tone whose pitch comes from the speaker id and
/// whose length follows the text.
#[derive(Debug, Clone)]
pub struct PlaceholderTts {
    identity: Arc<VoiceIdentity>,
    sample_rate: u32,
    per_char: Duration,
}

impl PlaceholderTts {
    pub fn new(identity: Arc<VoiceIdentity>, sample_rate: u32) -> Self {
        Self {
            identity,
            sample_rate,
            per_char: Duration::from_millis(60),
        }
    }
}

impl TtsBackend for PlaceholderTts {
    fn synthesize(&self, text: &str) -> VoiceResult<AudioBuffer> {
        let chars = text.trim().chars().count();
        if chars == 0 {
            return Ok(AudioBuffer::new(Vec::new(), self.sample_rate));
        }
        let seconds = self.per_char.as_secs_f32() * chars as f32;
        let len = (seconds * self.sample_rate as f32) as usize;
        let pitch = self.identity.pitch_hz();
        let rate = self.sample_rate as f32;
        let samples = (0..len)
            .map(|n| 0.08 * (TAU * pitch * n as f32 / rate).sin())
            .collect();
        Ok(AudioBuffer::new(samples, self.sample_rate))
    }

    fn name(&self) -> &str {
        "placeholder"
    }
}

/// OpenAI-compatible `/audio/speech`, asking for raw 16-bit little-endian
/// mono PCM so no decoder is needed.
///
/// The blocking HTTP client must not be built on an async thread, so it is
/// created on first use from a synthesis worker.
#[derive(Debug)]
pub struct SpeechApiTts {
    base_url: String,
    api_key: String,
    model: String,
    identity: Arc<VoiceIdentity>,
    sample_rate: u32,
    client: OnceCell<reqwest::blocking::Client>,
}

impl SpeechApiTts {
    pub fn from_config(config: &SynthesisConfig, identity: Arc<VoiceIdentity>) -> VoiceResult<Self> {
        let api_key = config.resolved_api_key().ok_or_else(|| {
            VoiceError::Config("speech synthesis requires synthesis.api_key, TTS_API_KEY or OPENAI_API_KEY".to_string())
        })?;
        Self::new(&config.base_url, api_key, &config.model, identity, config.sample_rate)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        identity: Arc<VoiceIdentity>,
        sample_rate: u32,
    ) -> VoiceResult<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            identity,
            sample_rate,
            client: OnceCell::new(),
        })
    }

    fn client(&self) -> VoiceResult<&reqwest::blocking::Client> {
        self.client.get_or_try_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .map_err(|e| VoiceError::Tts(e.to_string()))
        })
    }
}

impl TtsBackend for SpeechApiTts {
    fn synthesize(&self, text: &str) -> VoiceResult<AudioBuffer> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(AudioBuffer::new(Vec::new(), self.sample_rate));
        }
        let url = format!("{}/audio/speech", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.identity.voice,
            "response_format": "pcm",
        });
        let res = self
            .client()?
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(AudioBuffer::new(decode_pcm16le(&bytes), self.sample_rate))
    }

    fn name(&self) -> &str {
        "speech-api"
    }
}

/// Signed 16-bit little-endian PCM to f32 in -1.0..1.0. A trailing odd byte
/// is dropped.
pub fn decode_pcm16le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Where audio is heard. `play` starts output and returns immediately.
pub trait AudioDevice {
    fn play(&mut self, audio: &AudioBuffer) -> VoiceResult<()>;

    /// Whether anything started by `play` is still sounding.
    fn is_playing(&self) -> bool;

    fn stop(&mut self) -> VoiceResult<()>;
}

/// System default output via rodio. Not `Send`; build it on the thread
/// that plays.
pub struct RodioDevice {
    _stream: OutputStream,
    stream_handle: OutputStreamHandle,
    sink: Sink,
}

impl RodioDevice {
    pub fn new() -> VoiceResult<Self> {
        let (stream, stream_handle) = OutputStream::try_default()?;
        let sink = Sink::try_new(&stream_handle)?;
        info!("RodioDevice: default output ready");
        Ok(Self {
            _stream: stream,
            stream_handle,
            sink,
        })
    }
}

impl AudioDevice for RodioDevice {
    fn play(&mut self, audio: &AudioBuffer) -> VoiceResult<()> {
        if audio.is_empty() {
            return Ok(());
        }
        let source = SamplesBuffer::new(1, audio.sample_rate(), audio.samples().to_vec());
        self.sink.append(source);
        self.sink.play();
        Ok(())
    }

    fn is_playing(&self) -> bool {
        !self.sink.empty()
    }

    fn stop(&mut self) -> VoiceResult<()> {
        self.sink.stop();
        // A stopped sink stays stopped; start the next buffer on a fresh one.
        self.sink = Sink::try_new(&self.stream_handle)?;
        debug!("RodioDevice: stopped");
        Ok(())
    }
}

/// Discards audio. Every buffer finishes the moment it starts.
#[derive(Debug, Default)]
pub struct NullDevice {
    played: usize,
}

impl NullDevice {
    pub fn played(&self) -> usize {
        self.played
    }
}

impl AudioDevice for NullDevice {
    fn play(&mut self, audio: &AudioBuffer) -> VoiceResult<()> {
        self.played += 1;
        debug!(samples = audio.samples().len(), "NullDevice: discarded buffer");
        Ok(())
    }

    fn is_playing(&self) -> bool {
        false
    }

    fn stop(&mut self) -> VoiceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Arc<VoiceIdentity> {
        Arc::new(VoiceIdentity::generate("alloy"))
    }

    #[test]
    fn placeholder_length_follows_text() {
        let tts = PlaceholderTts::new(identity(), 24_000);
        let short = tts.synthesize("hi").unwrap();
        let long = tts.synthesize("hello there").unwrap();
        assert_eq!(short.sample_rate(), 24_000);
        assert!(long.samples().len() > short.samples().len());
        assert!(short.samples().iter().all(|s| s.abs() <= 0.08));
        assert!(tts.synthesize("   ").unwrap().is_empty());
    }

    #[test]
    fn pcm_decoding() {
        let bytes = [0x00, 0x00, 0xff, 0x7f, 0x00, 0x80, 0x01];
        let samples = decode_pcm16le(&bytes);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 0.99997).abs() < 1e-4);
        assert_eq!(samples[2], -1.0);
    }

    #[test]
    fn speech_backend_needs_a_key() {
        std::env::remove_var("TTS_API_KEY");
        std::env::remove_var("OPENAI_API_KEY");
        let config = SynthesisConfig {
            provider: TtsProvider::Speech,
            ..SynthesisConfig::default()
        };
        assert!(matches!(
            create_tts_backend(&config, identity()),
            Err(VoiceError::Config(_))
        ));
    }

    #[test]
    fn null_device_finishes_immediately() {
        let mut device = NullDevice::default();
        device.play(&AudioBuffer::new(vec![0.0; 10], 24_000)).unwrap();
        assert!(!device.is_playing());
        assert_eq!(device.played(), 1);
    }

    #[test]
    #[ignore] // Requires an audio output device
    fn rodio_device_plays_and_stops() {
        let mut device = RodioDevice::new().unwrap();
        let tts = PlaceholderTts::new(identity(), 24_000);
        device.play(&tts.synthesize("a fairly long sentence").unwrap()).unwrap();
        assert!(device.is_playing());
        device.stop().unwrap();
        assert!(!device.is_playing());
    }
}
