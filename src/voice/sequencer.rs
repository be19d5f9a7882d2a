//! Announcement sequencer.
//!
//! Drives one announcement per request:
//!
//! ```text
//! Idle → Connecting → PlayingStation ─┬─────────────────────→ Standby
//!                                      ├→ PlayingFinalClip ──→ Disconnected
//!                                      └─────────────────────→ Disconnected
//! (any) → Error
//! ```
//!
//! Every playback step gets a generation number.  Completion events carry
//! the generation of the step that produced them; an event whose generation
//! is not the one currently playing is stale and ignored, so a superseded
//! chain can never tear down the session or start the final clip.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::session::VoiceSessionManager;
use super::{PlaybackEvent, PlaybackNotifier, PlaybackOutcome};
use crate::error::AnnounceError;
use crate::routes::RouteDirectory;
use crate::station::StationAudioResolver;

/// Observable state of the announcement state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnnouncementState {
    Idle,
    Connecting {
        route: String,
        station: String,
    },
    PlayingStation {
        route: String,
        station: String,
        generation: u64,
    },
    PlayingFinalClip {
        route: String,
        station: String,
        generation: u64,
    },
    /// Station clip done, session kept for the next stop on the route.
    Standby {
        route: String,
        station: String,
    },
    Disconnected,
    Error {
        route: String,
        station: String,
        kind: String,
        message: String,
    },
}

impl AnnouncementState {
    /// Generation of the step currently playing, if any.
    pub fn playing_generation(&self) -> Option<u64> {
        match self {
            Self::PlayingStation { generation, .. } | Self::PlayingFinalClip { generation, .. } => {
                Some(*generation)
            }
            _ => None,
        }
    }
}

/// What a completion event means for the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Completion {
    Stale,
    StationDone { route: String, station: String },
    FinalClipDone { route: String, station: String },
    Failed { route: String, station: String, kind: &'static str, reason: String },
}

fn classify(state: &AnnouncementState, event: &PlaybackEvent) -> Completion {
    if state.playing_generation() != Some(event.generation) {
        return Completion::Stale;
    }

    let (route, station, final_clip) = match state {
        AnnouncementState::PlayingStation { route, station, .. } => (route, station, false),
        AnnouncementState::PlayingFinalClip { route, station, .. } => (route, station, true),
        _ => return Completion::Stale,
    };
    let (route, station) = (route.clone(), station.clone());

    match &event.outcome {
        PlaybackOutcome::Finished if final_clip => Completion::FinalClipDone { route, station },
        PlaybackOutcome::Finished => Completion::StationDone { route, station },
        PlaybackOutcome::Failed(reason) => Completion::Failed {
            route,
            station,
            kind: "playback_failed",
            reason: reason.clone(),
        },
        PlaybackOutcome::TimedOut => Completion::Failed {
            route,
            station,
            kind: "playback_timeout",
            reason: "clip did not finish in time".to_string(),
        },
    }
}

/// Next move once a station clip has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NextStep {
    PlayFinalClip(PathBuf),
    KeepSession,
    Teardown,
}

fn after_station(
    at_last_stop: bool,
    final_clip: Option<PathBuf>,
    disconnect_after_each_stop: bool,
) -> NextStep {
    match (at_last_stop, final_clip) {
        (true, Some(clip)) => NextStep::PlayFinalClip(clip),
        (true, None) => NextStep::Teardown,
        (false, _) if disconnect_after_each_stop => NextStep::Teardown,
        (false, _) => NextStep::KeepSession,
    }
}

/// Tunables for [`AnnouncementSequencer`].
#[derive(Debug, Clone, Default)]
pub struct SequencerOptions {
    /// Leave the channel after every stop, not only at the end of the line.
    pub disconnect_after_each_stop: bool,
    /// Treat a clip that has not finished after this long as failed.
    pub playback_timeout: Option<Duration>,
}

struct Inner {
    sessions: VoiceSessionManager,
    generation: u64,
    watchdog: Option<AbortHandle>,
}

impl Inner {
    /// Start a new generation; every older completion event becomes stale.
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.disarm_watchdog();
        self.generation
    }

    fn disarm_watchdog(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

/// Orders station and final-clip playback on the shared voice session.
///
/// Requests are serialised on an internal mutex: a second announcement
/// waits until the first has been accepted, then supersedes its chain.
pub struct AnnouncementSequencer {
    inner: Mutex<Inner>,
    routes: Arc<RouteDirectory>,
    resolver: StationAudioResolver,
    options: SequencerOptions,
    events_tx: mpsc::UnboundedSender<PlaybackEvent>,
    state_tx: watch::Sender<AnnouncementState>,
    /// Channel of the live session, 0 when none.
    connected_channel: AtomicU64,
}

impl AnnouncementSequencer {
    /// Create the sequencer and spawn the task that consumes completion events.
    pub fn spawn(
        sessions: VoiceSessionManager,
        routes: Arc<RouteDirectory>,
        resolver: StationAudioResolver,
        options: SequencerOptions,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(AnnouncementState::Idle);

        let sequencer = Arc::new(Self {
            inner: Mutex::new(Inner {
                sessions,
                generation: 0,
                watchdog: None,
            }),
            routes,
            resolver,
            options,
            events_tx,
            state_tx,
            connected_channel: AtomicU64::new(0),
        });

        tokio::spawn(Self::event_loop(Arc::downgrade(&sequencer), events_rx));
        sequencer
    }

    async fn event_loop(sequencer: Weak<Self>, mut rx: mpsc::UnboundedReceiver<PlaybackEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(sequencer) = sequencer.upgrade() else {
                break;
            };
            sequencer.handle_playback_event(event).await;
        }
        debug!("Sequencer event loop finished");
    }

    pub fn state(&self) -> AnnouncementState {
        self.state_tx.borrow().clone()
    }

    /// Watch every state transition.
    pub fn subscribe(&self) -> watch::Receiver<AnnouncementState> {
        self.state_tx.subscribe()
    }

    /// Channel id of the live voice session, if any.
    pub fn connected_channel(&self) -> Option<u64> {
        match self.connected_channel.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    fn set_state(&self, state: AnnouncementState) {
        debug!(?state, "Announcement state");
        self.state_tx.send_replace(state);
    }

    fn sync_channel(&self, inner: &Inner) {
        let id = inner.sessions.current().map(|s| s.channel_id()).unwrap_or(0);
        self.connected_channel.store(id, Ordering::Release);
    }

    fn fail(&self, route: &str, station: &str, err: AnnounceError) -> AnnounceError {
        warn!(route, station, kind = err.kind(), error = %err, "Announcement failed");
        self.set_state(AnnouncementState::Error {
            route: route.to_string(),
            station: station.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        err
    }

    /// Announce `station` on `route_id`.
    ///
    /// Returns as soon as the station clip has started; the rest of the
    /// chain runs off completion events.
    pub async fn announce(&self, route_id: &str, station: &str) -> Result<String, AnnounceError> {
        let route_id = route_id.trim();
        let station = station.trim();
        if route_id.is_empty() || station.is_empty() {
            return Err(AnnounceError::InvalidRequest(
                "Missing routeName or stationName".to_string(),
            ));
        }

        // Unknown routes are rejected without disturbing a running chain.
        if let Err(e) = self.routes.get(route_id) {
            warn!(route = route_id, station, "No route configured");
            return Err(e);
        }

        let mut inner = self.inner.lock().await;
        let generation = inner.next_generation();
        self.set_state(AnnouncementState::Connecting {
            route: route_id.to_string(),
            station: station.to_string(),
        });

        let connected = inner.sessions.ensure_connected(route_id).await.map(|_| ());
        self.sync_channel(&inner);
        if let Err(e) = connected {
            return Err(self.fail(route_id, station, e));
        }

        // A missing clip leaves the session up for the next request.
        let clip = match self.resolver.resolve(station).await {
            Ok(clip) => clip,
            Err(e) => return Err(self.fail(route_id, station, e)),
        };

        if let Err(e) = self.play_step(&mut inner, generation, &clip).await {
            self.teardown_locked(&mut inner).await;
            return Err(self.fail(route_id, station, e));
        }

        info!(
            route = route_id,
            station,
            generation,
            clip = %clip.display(),
            "Playing station announcement"
        );
        self.set_state(AnnouncementState::PlayingStation {
            route: route_id.to_string(),
            station: station.to_string(),
            generation,
        });

        Ok(format!("Playing {}", station))
    }

    async fn play_step(
        &self,
        inner: &mut Inner,
        generation: u64,
        clip: &Path,
    ) -> Result<(), AnnounceError> {
        let session = inner
            .sessions
            .current()
            .ok_or_else(|| AnnounceError::Internal("no voice session".to_string()))?;

        let notifier = PlaybackNotifier::new(generation, self.events_tx.clone());
        session
            .connection()
            .play(clip, notifier.clone())
            .await
            .map_err(|e| AnnounceError::Internal(e.to_string()))?;

        if let Some(limit) = self.options.playback_timeout {
            let task = tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                notifier.notify(PlaybackOutcome::TimedOut);
            });
            inner.watchdog = Some(task.abort_handle());
        }
        Ok(())
    }

    async fn teardown_locked(&self, inner: &mut Inner) {
        inner.disarm_watchdog();
        inner.sessions.teardown().await;
        self.sync_channel(inner);
    }

    /// Apply a completion event from the voice backend.
    pub async fn handle_playback_event(&self, event: PlaybackEvent) {
        let mut inner = self.inner.lock().await;

        match classify(&self.state(), &event) {
            Completion::Stale => {
                debug!(
                    generation = event.generation,
                    outcome = ?event.outcome,
                    "Ignoring stale playback event"
                );
            }
            Completion::StationDone { route, station } => {
                let at_last_stop = self
                    .routes
                    .get(&route)
                    .is_ok_and(|r| r.is_last_stop(&station));
                let final_clip = if at_last_stop {
                    self.resolver.final_clip().await
                } else {
                    None
                };

                let disconnect = self.options.disconnect_after_each_stop;
                match after_station(at_last_stop, final_clip, disconnect) {
                    NextStep::PlayFinalClip(clip) => {
                        let generation = inner.next_generation();
                        match self.play_step(&mut inner, generation, &clip).await {
                            Ok(()) => {
                                info!(
                                    route = %route,
                                    station = %station,
                                    generation,
                                    "Playing end-of-line clip"
                                );
                                self.set_state(AnnouncementState::PlayingFinalClip {
                                    route,
                                    station,
                                    generation,
                                });
                            }
                            Err(e) => {
                                self.teardown_locked(&mut inner).await;
                                self.fail(&route, &station, e);
                            }
                        }
                    }
                    NextStep::KeepSession => {
                        inner.disarm_watchdog();
                        info!(
                            route = %route,
                            station = %station,
                            "Station announced, staying connected"
                        );
                        self.set_state(AnnouncementState::Standby { route, station });
                    }
                    NextStep::Teardown => {
                        self.teardown_locked(&mut inner).await;
                        info!(
                            route = %route,
                            station = %station,
                            "Announcement finished, disconnected"
                        );
                        self.set_state(AnnouncementState::Disconnected);
                    }
                }
            }
            Completion::FinalClipDone { route, station } => {
                self.teardown_locked(&mut inner).await;
                info!(route = %route, station = %station, "End of line announced, disconnected");
                self.set_state(AnnouncementState::Disconnected);
            }
            Completion::Failed {
                route,
                station,
                kind,
                reason,
            } => {
                self.teardown_locked(&mut inner).await;
                warn!(
                    route = %route,
                    station = %station,
                    kind,
                    reason = %reason,
                    "Playback failed"
                );
                self.set_state(AnnouncementState::Error {
                    route,
                    station,
                    kind: kind.to_string(),
                    message: reason,
                });
            }
        }
    }

    /// Invalidate any running chain and leave the voice channel.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.next_generation();
        self.teardown_locked(&mut inner).await;
        self.set_state(AnnouncementState::Disconnected);
    }
}
