//! Error taxonomy shared by the announcement pipeline and the HTTP boundary.

use thiserror::Error;

/// Failures reported by a voice backend (gateway handshake, driver, playback).
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Discord gateway is not ready")]
    NotReady,

    #[error("voice channel {channel_id} does not exist in the guild")]
    UnknownChannel { channel_id: u64 },

    #[error("voice handshake for channel {channel_id} timed out")]
    HandshakeTimeout { channel_id: u64 },

    #[error("voice handshake failed: {0}")]
    Handshake(String),

    #[error("voice driver error: {0}")]
    Driver(String),

    #[error("playback error: {0}")]
    Playback(String),
}

/// Errors surfaced to callers of the announcement and departure operations.
#[derive(Error, Debug)]
pub enum AnnounceError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    #[error("Voice channel not found for route {0}")]
    ChannelNotFound(String),

    #[error("Audio file not found for station {0}")]
    AudioNotFound(String),

    #[error("Failed to join voice channel: {0}")]
    Connect(#[from] VoiceError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnnounceError {
    /// Short machine-friendly label used in logs and the status endpoint.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownRoute(_) => "unknown_route",
            Self::ChannelNotFound(_) => "channel_not_found",
            Self::AudioNotFound(_) => "audio_not_found",
            Self::Connect(_) => "connect_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_wraps_voice_error() {
        let err: AnnounceError = VoiceError::HandshakeTimeout { channel_id: 42 }.into();
        assert_eq!(err.kind(), "connect_error");
        assert_eq!(
            err.to_string(),
            "Failed to join voice channel: voice handshake for channel 42 timed out"
        );
    }

    #[test]
    fn audio_not_found_message_names_station() {
        let err = AnnounceError::AudioNotFound("Spawn".into());
        assert_eq!(err.to_string(), "Audio file not found for station Spawn");
    }
}
