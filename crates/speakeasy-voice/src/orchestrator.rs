//! Voice pipeline orchestrator: wires the stages together and hands back a
//! handle for feeding utterances, issuing CLEAR and shutting down.

use crate::command::{CommandBus, Inbox};
use crate::completion::{create_completion_service, CompletionService};
use crate::config::{OutputDevice, PipelineConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::identity::VoiceIdentity;
use crate::message::{Envelope, Generation, TranscriptEvent, Utterance};
use crate::normalize::{SpokenFormNormalizer, TextNormalizer};
use crate::playback::{DeviceFactory, PlaybackController, PlaybackEvent, PlaybackState};
use crate::scheduler::SynthesisScheduler;
use crate::segmenter::{Segmenter, SegmenterStage};
use crate::streamer::CompletionStreamer;
use crate::voice_output::{create_tts_backend, AudioDevice, NullDevice, RodioDevice, TtsBackend};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A configured but not yet running pipeline.
pub struct VoicePipeline {
    config: Arc<PipelineConfig>,
    completion: Arc<dyn CompletionService>,
    tts: Arc<dyn TtsBackend>,
    normalizer: Option<Arc<dyn TextNormalizer>>,
    device: DeviceFactory,
}

fn device_factory(device: OutputDevice) -> DeviceFactory {
    match device {
        OutputDevice::Default => Box::new(|| Ok(Box::new(RodioDevice::new()?) as Box<dyn AudioDevice>)),
        OutputDevice::Null => Box::new(|| Ok(Box::new(NullDevice::default()) as Box<dyn AudioDevice>)),
    }
}

impl VoicePipeline {
    /// Assemble a pipeline from explicit backends.
    pub fn new(
        config: PipelineConfig,
        completion: Arc<dyn CompletionService>,
        tts: Arc<dyn TtsBackend>,
    ) -> VoiceResult<Self> {
        config.validate()?;
        let normalizer: Option<Arc<dyn TextNormalizer>> = if config.segmenter.normalize {
            Some(Arc::new(SpokenFormNormalizer::default()))
        } else {
            None
        };
        let device = device_factory(config.playback.device);
        Ok(Self {
            config: Arc::new(config),
            completion,
            tts,
            normalizer,
            device,
        })
    }

    /// Build every backend from the config: completion client, voice
    /// identity (read or created once) and TTS engine.
    pub fn from_config(config: PipelineConfig) -> VoiceResult<Self> {
        config.validate()?;
        let completion = create_completion_service(&config.completion)?;
        let identity = Arc::new(VoiceIdentity::load_or_create(
            &config.synthesis.identity_path,
            &config.synthesis.default_voice,
        )?);
        let tts = create_tts_backend(&config.synthesis, identity)?;
        Self::new(config, completion, tts)
    }

    /// Replace the audio device, e.g. with a test double.
    pub fn with_device<F>(mut self, factory: F) -> Self
    where
        F: FnOnce() -> VoiceResult<Box<dyn AudioDevice>> + Send + 'static,
    {
        self.device = Box::new(factory);
        self
    }

    pub fn with_normalizer(mut self, normalizer: Option<Arc<dyn TextNormalizer>>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawn every stage. Must be called from inside a tokio runtime.
    pub fn start(self) -> VoiceResult<PipelineHandle> {
        let config = Arc::clone(&self.config);
        let capacity = config.pipeline.channel_capacity;
        let bus = CommandBus::new(config.pipeline.command_capacity);

        let (utterance_tx, utterance_rx) = mpsc::channel(capacity);
        let (text_tx, text_rx) = mpsc::channel(capacity);
        let (chunk_tx, chunk_rx) = mpsc::channel(capacity);
        let (audio_tx, audio_rx) = mpsc::channel(capacity);
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel::<TranscriptEvent>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<PlaybackEvent>();

        let (playback_thread, state) = PlaybackController::spawn(
            self.device,
            bus.listener(),
            config.playback.poll_interval(),
            config.playback.stop_timeout(),
            Some(events_tx),
            Inbox::new(audio_rx),
        )?;

        let streamer = CompletionStreamer::new(
            self.completion,
            config.completion.system_prompt.clone(),
            bus.listener(),
        )
        .with_transcript(transcript_tx)
        .abort_on_clear(config.segmenter.mute_rest_of_turn);

        let segmenter = SegmenterStage::new(
            Segmenter::new(config.segmenter.clone(), self.normalizer),
            bus.listener(),
        );

        let scheduler = SynthesisScheduler::new(
            self.tts,
            config.synthesis.workers,
            config.synthesis.queue_depth,
            bus.listener(),
        );

        let tasks = vec![
            ("completion", tokio::spawn(streamer.run(utterance_rx, text_tx))),
            ("segmenter", tokio::spawn(segmenter.run(text_rx, chunk_tx))),
            ("scheduler", tokio::spawn(scheduler.run(Inbox::new(chunk_rx), audio_tx))),
        ];

        info!(
            workers = config.synthesis.workers,
            max_chunk_chars = config.segmenter.max_chunk_chars,
            "voice pipeline started"
        );

        Ok(PipelineHandle {
            utterances: utterance_tx,
            bus,
            transcript: Some(transcript_rx),
            events: Some(events_rx),
            state,
            tasks,
            playback_thread: Some(playback_thread),
        })
    }
}

/// Control surface of a running pipeline.
pub struct PipelineHandle {
    utterances: mpsc::Sender<Envelope<Utterance>>,
    bus: CommandBus,
    transcript: Option<mpsc::UnboundedReceiver<TranscriptEvent>>,
    events: Option<mpsc::UnboundedReceiver<PlaybackEvent>>,
    state: watch::Receiver<PlaybackState>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    playback_thread: Option<thread::JoinHandle<()>>,
}

impl PipelineHandle {
    /// Queue a user turn. Turns are answered one at a time, in order.
    pub async fn submit(&self, utterance: impl Into<Utterance>) -> VoiceResult<()> {
        self.utterances
            .send(Envelope::Data(utterance.into()))
            .await
            .map_err(|_| VoiceError::ChannelClosed("completion streamer has stopped".into()))
    }

    /// Stop speaking now and forget everything queued.
    pub fn clear(&self) -> Generation {
        self.bus.clear()
    }

    /// Assistant text as it streams. Can be taken once.
    pub fn take_transcript(&mut self) -> Option<mpsc::UnboundedReceiver<TranscriptEvent>> {
        self.transcript.take()
    }

    /// Per-buffer playback events. Can be taken once.
    pub fn take_playback_events(&mut self) -> Option<mpsc::UnboundedReceiver<PlaybackEvent>> {
        self.events.take()
    }

    pub fn playback_state(&self) -> watch::Receiver<PlaybackState> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        *self.state.borrow() != PlaybackState::Terminated
    }

    /// Send end-of-session and wait for every stage to flush and stop.
    /// Anything already queued is still spoken.
    pub async fn finish(mut self) -> VoiceResult<()> {
        info!("ending voice session");
        // A closed queue means the streamer is already gone, which is the
        // state we are heading for anyway.
        let _ = self.utterances.send(Envelope::EndOfSession).await;

        for (stage, task) in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(stage, error = %e, "pipeline stage panicked");
            }
        }

        if let Some(thread) = self.playback_thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| VoiceError::Playback(format!("join playback thread: {e}")))?;
            if joined.is_err() {
                error!(stage = "playback", "pipeline stage panicked");
            }
        }

        info!("voice session ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice_output::PlaceholderTts;

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.synthesis.workers = 0;
        let completion = create_completion_service(&PipelineConfig::default().completion).unwrap();
        let tts = Arc::new(PlaceholderTts::new(Arc::new(VoiceIdentity::generate("alloy")), 24_000));
        let result = VoicePipeline::new(config, completion, tts);
        assert!(matches!(result, Err(VoiceError::Config(_))));
    }

    #[tokio::test]
    async fn from_config_creates_identity_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.synthesis.identity_path = dir.path().join("speaker.toml");
        config.playback.device = OutputDevice::Null;

        let handle = VoicePipeline::from_config(config).unwrap().start().unwrap();
        assert!(dir.path().join("speaker.toml").exists());
        assert!(handle.is_running());
        handle.finish().await.unwrap();
    }
}
