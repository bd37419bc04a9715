//! # Speakeasy Voice - Streaming Speech Pipeline
//!
//! Turns a streamed LLM reply into speech while it is still being written.
//! Text is cut into short speakable chunks, synthesized in parallel and
//! played back strictly in order. A single CLEAR silences the speaker and
//! drops everything still queued.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Voice Pipeline                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐            │
//! │  │  Completion  │→ │  Segmenter   │→ │  Scheduler   │            │
//! │  │  (streamed)  │  │ (fast path)  │  │ (N workers)  │            │
//! │  └──────────────┘  └──────────────┘  └──────────────┘            │
//! │         ↑                                    ↓                   │
//! │  ┌──────────────┐                    ┌──────────────┐            │
//! │  │  Command Bus │────── CLEAR ──────→│   Playback   │            │
//! │  │ (generation) │   (every stage)    │   (rodio)    │            │
//! │  └──────────────┘                    └──────────────┘            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod command;
pub mod completion;
pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod normalize;
pub mod orchestrator;
pub mod playback;
pub mod scheduler;
pub mod segmenter;
pub mod streamer;
pub mod voice_output;

pub use command::{Command, CommandBus, CommandListener, ControlSignal, Inbox};
pub use completion::{
    create_completion_service, ChatRequest, CompletionService, FragmentStream, OllamaClient, OpenAiCompatClient,
};
pub use config::{
    ChannelConfig, CompletionConfig, CompletionProvider, NormalizationOrder, OutputDevice, PipelineConfig,
    PlaybackConfig, SegmenterConfig, SynthesisConfig, TtsProvider,
};
pub use error::{VoiceError, VoiceResult};
pub use identity::VoiceIdentity;
pub use message::{
    AudioBuffer, Chunk, Envelope, Generation, SynthesisTask, SynthesizedAudio, TextEvent, TranscriptEvent, Utterance,
};
pub use normalize::{SpokenFormNormalizer, TextNormalizer};
pub use orchestrator::{PipelineHandle, VoicePipeline};
pub use playback::{DeviceFactory, PlaybackController, PlaybackEvent, PlaybackState};
pub use scheduler::{ReorderBuffer, SynthesisScheduler};
pub use segmenter::{enforce_length, Segmenter, SegmenterStage};
pub use streamer::CompletionStreamer;
pub use voice_output::{
    create_tts_backend, AudioDevice, NullDevice, PlaceholderTts, RodioDevice, SpeechApiTts, TtsBackend,
};
