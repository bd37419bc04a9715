//! Persistent speaker identity.
//!
//! The assistant should sound like the same speaker across sessions, so the
//! identity is created once, written to disk and reused by every synthesis
//! call afterwards.

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceIdentity {
    pub speaker_id: Uuid,
    /// Voice name passed to speech APIs (e.g. `alloy`, `nova`).
    pub voice: String,
    pub created_at: DateTime<Utc>,
}

impl VoiceIdentity {
    pub fn generate(voice: impl Into<String>) -> Self {
        Self {
            speaker_id: Uuid::new_v4(),
            voice: voice.into(),
            created_at: Utc::now(),
        }
    }

    /// Read the identity at `path`, or create and save a new one if the file
    /// does not exist yet.
    pub fn load_or_create(path: &Path, default_voice: &str) -> VoiceResult<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let identity: VoiceIdentity = toml::from_str(&content)
                .map_err(|e| VoiceError::Identity(format!("{}: {}", path.display(), e)))?;
            info!(speaker_id = %identity.speaker_id, voice = %identity.voice, "loaded voice identity");
            Ok(identity)
        } else {
            let identity = Self::generate(default_voice);
            identity.save_to_path(path)?;
            info!(
                speaker_id = %identity.speaker_id,
                path = %path.display(),
                "created new voice identity"
            );
            Ok(identity)
        }
    }

    pub fn save_to_path(&self, path: &Path) -> VoiceResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| VoiceError::Identity(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(path, content)?;
        Ok(())
    }

    /// Stable pitch in 110..330 Hz derived from the speaker id.
    pub fn pitch_hz(&self) -> f32 {
        let bytes = self.speaker_id.as_bytes();
        let seed = u16::from_le_bytes([bytes[0], bytes[1]]);
        110.0 + f32::from(seed % 220)
    }
}
