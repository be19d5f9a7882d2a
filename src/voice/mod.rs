//! Discord voice playback for station announcements.
//!
//! The voice transport itself is external: [`VoiceBackend`] joins a channel
//! and hands back a [`VoiceConnection`] that can play a clip and report,
//! asynchronously, when the clip is done.  The production backend wraps the
//! songbird driver ([`driver::SongbirdBackend`]); tests use
//! [`mock::MockVoiceBackend`].

pub mod driver;
pub mod mock;
pub mod sequencer;
pub mod session;

#[cfg(test)]
mod e2e_test;

pub use sequencer::{AnnouncementSequencer, AnnouncementState, SequencerOptions};
pub use session::{VoiceSession, VoiceSessionManager};

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::VoiceError;

/// How a playback step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Failed(String),
    TimedOut,
}

/// Completion notification for one playback step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackEvent {
    /// Generation of the step that produced this event.
    pub generation: u64,
    pub outcome: PlaybackOutcome,
}

/// Sender half handed to a connection for a single playback step.
///
/// Tagged with the step's generation so the sequencer can drop events
/// from steps it has already moved past.
#[derive(Debug, Clone)]
pub struct PlaybackNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackNotifier {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn notify(&self, outcome: PlaybackOutcome) {
        let event = PlaybackEvent {
            generation: self.generation,
            outcome,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(
                generation = self.generation,
                "Sequencer gone, dropping playback event"
            );
        }
    }
}

/// A live connection to one voice channel.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn channel_id(&self) -> u64;

    /// `false` once the connection was dropped from outside (kicked, channel
    /// deleted, driver lost).  A dead connection must not be reused.
    fn is_alive(&self) -> bool {
        true
    }

    /// Start playing `clip`, replacing anything already playing.
    ///
    /// Returns once playback has been queued; the outcome is reported
    /// exactly once through `notifier`.
    async fn play(&self, clip: &Path, notifier: PlaybackNotifier) -> Result<(), VoiceError>;

    /// Stop playback and leave the channel.
    async fn disconnect(&self) -> Result<(), VoiceError>;
}

/// Factory for voice connections (the external voice service).
#[async_trait]
pub trait VoiceBackend: Send + Sync {
    /// Join `channel_id`. On error no connection is left behind.
    async fn join(&self, channel_id: u64) -> Result<Box<dyn VoiceConnection>, VoiceError>;

    /// Human-readable backend name.
    fn name(&self) -> &str;
}
