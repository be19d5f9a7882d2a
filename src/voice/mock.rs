//! Mock voice backend for testing.
//!
//! Records every join, play and disconnect, and keeps the notifier of each
//! playback step so tests decide when a clip "finishes".  Clones share state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{PlaybackNotifier, PlaybackOutcome, VoiceBackend, VoiceConnection};
use crate::error::VoiceError;

/// Join and disconnect calls, in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    Join(u64),
    Disconnect(u64),
}

/// One recorded `play` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPlay {
    pub channel_id: u64,
    pub clip: PathBuf,
    pub generation: u64,
}

#[derive(Default)]
struct MockState {
    joins: Vec<u64>,
    disconnects: Vec<u64>,
    history: Vec<MockEvent>,
    plays: Vec<MockPlay>,
    notifiers: Vec<PlaybackNotifier>,
    live: usize,
    max_live: usize,
    next_connection: u64,
    severed: Vec<u64>,
    missing_channels: Vec<u64>,
    fail_joins: bool,
    fail_disconnects: bool,
    fail_plays: bool,
}

/// Voice backend that never touches the network.
#[derive(Clone, Default)]
pub struct MockVoiceBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockVoiceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Make subsequent joins fail with a handshake error.
    pub fn fail_joins(&self, fail: bool) {
        self.with_state(|s| s.fail_joins = fail);
    }

    /// Pretend `channel_id` no longer exists in the guild.
    pub fn remove_channel(&self, channel_id: u64) {
        self.with_state(|s| s.missing_channels.push(channel_id));
    }

    /// Drop every connection handed out so far from the far side, as if the
    /// bot had been kicked or the voice driver had lost its link.
    pub fn sever_connections(&self) {
        self.with_state(|s| s.severed.extend(0..s.next_connection));
    }

    /// Make subsequent disconnects report an error.
    pub fn fail_disconnects(&self, fail: bool) {
        self.with_state(|s| s.fail_disconnects = fail);
    }

    /// Make subsequent plays fail immediately.
    pub fn fail_plays(&self, fail: bool) {
        self.with_state(|s| s.fail_plays = fail);
    }

    /// Channel ids joined, in order.
    pub fn joins(&self) -> Vec<u64> {
        self.with_state(|s| s.joins.clone())
    }

    /// Channel ids successfully disconnected, in order.
    pub fn disconnects(&self) -> Vec<u64> {
        self.with_state(|s| s.disconnects.clone())
    }

    pub fn plays(&self) -> Vec<MockPlay> {
        self.with_state(|s| s.plays.clone())
    }

    /// File names of the played clips, in order.
    pub fn played_files(&self) -> Vec<String> {
        self.with_state(|s| {
            s.plays
                .iter()
                .filter_map(|p| p.clip.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect()
        })
    }

    /// Joins and disconnects interleaved in call order.
    pub fn history(&self) -> Vec<MockEvent> {
        self.with_state(|s| s.history.clone())
    }

    /// Highest number of connections that were alive at the same time.
    pub fn max_live(&self) -> usize {
        self.with_state(|s| s.max_live)
    }

    /// Connections that have been handed out and not yet dropped.
    pub fn live_connections(&self) -> usize {
        self.with_state(|s| s.live)
    }

    /// Report `outcome` for the most recent playback step.
    ///
    /// Returns `false` if nothing has been played yet.
    pub fn complete_latest(&self, outcome: PlaybackOutcome) -> bool {
        let notifier = self.with_state(|s| s.notifiers.last().cloned());
        match notifier {
            Some(n) => {
                n.notify(outcome);
                true
            }
            None => false,
        }
    }

    /// Shorthand for completing the latest step successfully.
    pub fn finish_latest(&self) -> bool {
        self.complete_latest(PlaybackOutcome::Finished)
    }

    /// Report `outcome` for the step at `index` (in play order), even if it
    /// has since been superseded.
    pub fn complete_step(&self, index: usize, outcome: PlaybackOutcome) -> bool {
        let notifier = self.with_state(|s| s.notifiers.get(index).cloned());
        match notifier {
            Some(n) => {
                n.notify(outcome);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl VoiceBackend for MockVoiceBackend {
    async fn join(&self, channel_id: u64) -> Result<Box<dyn VoiceConnection>, VoiceError> {
        let id = self.with_state(|s| {
            if s.missing_channels.contains(&channel_id) {
                return Err(VoiceError::UnknownChannel { channel_id });
            }
            if s.fail_joins {
                return Err(VoiceError::Handshake(format!(
                    "mock refused to join channel {}",
                    channel_id
                )));
            }
            s.joins.push(channel_id);
            s.history.push(MockEvent::Join(channel_id));
            s.live += 1;
            s.max_live = s.max_live.max(s.live);
            s.next_connection += 1;
            Ok(s.next_connection - 1)
        })?;

        Ok(Box::new(MockConnection {
            id,
            channel_id,
            backend: self.clone(),
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockConnection {
    id: u64,
    channel_id: u64,
    backend: MockVoiceBackend,
}

#[async_trait]
impl VoiceConnection for MockConnection {
    fn channel_id(&self) -> u64 {
        self.channel_id
    }

    fn is_alive(&self) -> bool {
        !self.backend.with_state(|s| s.severed.contains(&self.id))
    }

    async fn play(&self, clip: &Path, notifier: PlaybackNotifier) -> Result<(), VoiceError> {
        self.backend.with_state(|s| {
            if s.fail_plays {
                return Err(VoiceError::Playback("mock playback failure".to_string()));
            }
            s.plays.push(MockPlay {
                channel_id: self.channel_id,
                clip: clip.to_path_buf(),
                generation: notifier.generation(),
            });
            s.notifiers.push(notifier);
            Ok(())
        })
    }

    async fn disconnect(&self) -> Result<(), VoiceError> {
        self.backend.with_state(|s| {
            if s.fail_disconnects {
                return Err(VoiceError::Driver("mock disconnect failure".to_string()));
            }
            s.disconnects.push(self.channel_id);
            s.history.push(MockEvent::Disconnect(self.channel_id));
            Ok(())
        })
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.backend.with_state(|s| s.live = s.live.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn records_lifecycle() {
        let backend = MockVoiceBackend::new();
        let conn = backend.join(70).await.unwrap();
        assert_eq!(backend.live_connections(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.play(Path::new("/audio/spawn.mp3"), PlaybackNotifier::new(3, tx))
            .await
            .unwrap();
        assert_eq!(backend.played_files(), vec!["spawn.mp3".to_string()]);
        assert_eq!(backend.plays()[0].generation, 3);

        assert!(backend.finish_latest());
        assert_eq!(rx.try_recv().unwrap().generation, 3);

        conn.disconnect().await.unwrap();
        drop(conn);
        assert_eq!(backend.disconnects(), vec![70]);
        assert_eq!(backend.live_connections(), 0);
    }

    #[tokio::test]
    async fn severed_connections_report_dead() {
        let backend = MockVoiceBackend::new();
        let first = backend.join(70).await.unwrap();
        assert!(first.is_alive());

        backend.sever_connections();
        assert!(!first.is_alive());

        let second = backend.join(70).await.unwrap();
        assert!(second.is_alive());
        assert_eq!(backend.max_live(), 2);
    }

    #[tokio::test]
    async fn finish_without_play_is_false() {
        let backend = MockVoiceBackend::new();
        assert!(!backend.finish_latest());
    }

    #[tokio::test]
    async fn failing_join_counts_nothing() {
        let backend = MockVoiceBackend::new();
        backend.fail_joins(true);
        assert!(backend.join(70).await.is_err());
        assert!(backend.joins().is_empty());
        assert_eq!(backend.live_connections(), 0);
    }
}
