//! Values that travel between pipeline stages.
//!
//! Every queue carries a tagged variant so end-of-session can never be
//! confused with an empty piece of data.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Command bus epoch. Incremented by every CLEAR; data stamped with an
/// older generation is stale and must not reach the speaker.
pub type Generation = u64;

/// Data or the end-of-session marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<T> {
    Data(T),
    EndOfSession,
}

/// One user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    text: String,
}

impl Utterance {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl From<&str> for Utterance {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Utterance {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Output of the completion streamer. End-of-turn and end-of-session are
/// distinct: the first re-arms the segmenter, the second shuts it down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEvent {
    /// A delta, stamped with the bus generation current when it was read.
    Fragment { text: String, generation: Generation },
    EndOfTurn,
    EndOfSession,
}

impl TextEvent {
    pub fn fragment(text: impl Into<String>, generation: Generation) -> Self {
        TextEvent::Fragment {
            text: text.into(),
            generation,
        }
    }
}

/// A finalized, non-empty unit of speakable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub generation: Generation,
}

impl Chunk {
    pub fn new(text: impl Into<String>, generation: Generation) -> Self {
        Self {
            text: text.into(),
            generation,
        }
    }

    /// Length in characters, which is what the chunk size limit counts.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A chunk with its playback position inside the current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisTask {
    pub seq: u64,
    pub chunk: Chunk,
}

/// Decoded mono waveform. Cloning shares the samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Audio released by the scheduler, in sequence order.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub seq: u64,
    pub generation: Generation,
    pub text: String,
    pub audio: AudioBuffer,
}

/// Assistant text as it streams, for front ends that print or render it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    UserTurn(String),
    Delta(String),
    TurnComplete,
    TurnFailed(String),
}
