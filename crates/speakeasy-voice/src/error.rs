//! Error types for the speakeasy voice pipeline

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while streaming, synthesizing or playing a reply.
///
/// Stage loops never bubble these up: they log and carry on with the next
/// fragment, chunk or buffer. Only construction and startup return them.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Completion service returned {status}: {body}")]
    CompletionStatus { status: u16, body: String },

    #[error("Completion service rate limited the request")]
    RateLimited,

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Synthesis cancelled")]
    Cancelled,

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Normalization error: {0}")]
    Normalize(String),

    #[error("Voice identity error: {0}")]
    Identity(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<rodio::StreamError> for VoiceError {
    fn from(err: rodio::StreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<rodio::PlayError> for VoiceError {
    fn from(err: rodio::PlayError) -> Self {
        VoiceError::Playback(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Completion(err.to_string())
    }
}

impl VoiceError {
    /// Errors raised by the completion service boundary.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            VoiceError::Completion(_) | VoiceError::CompletionStatus { .. } | VoiceError::RateLimited
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_mentions_code_and_body() {
        let err = VoiceError::CompletionStatus {
            status: 503,
            body: "overloaded".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("503"));
        assert!(msg.contains("overloaded"));
        assert!(err.is_upstream());
        assert!(!VoiceError::Tts("x".into()).is_upstream());
    }
}
