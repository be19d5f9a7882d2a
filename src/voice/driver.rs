//! Voice backend on top of the standalone songbird driver.
//!
//! The gateway task performs the op 4 handshake; the resulting
//! [`VoiceCredentials`] are turned into a songbird `ConnectionInfo` and handed
//! to a fresh `Driver`.  No serenity involved.

use std::num::NonZeroU64;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use songbird::events::{
    CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent,
};
use songbird::id::{ChannelId, GuildId, UserId};
use songbird::input::{File as FileInput, Input};
use songbird::tracks::PlayMode;
use songbird::{Config as DriverConfig, ConnectionInfo, Driver};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{PlaybackNotifier, PlaybackOutcome, VoiceBackend, VoiceConnection};
use crate::discord::{GatewayHandle, VoiceCredentials};
use crate::error::VoiceError;

/// Joins voice channels of one guild through the gateway task.
pub struct SongbirdBackend {
    gateway: GatewayHandle,
    guild_id: u64,
    join_timeout: Duration,
}

impl SongbirdBackend {
    pub fn new(gateway: GatewayHandle, guild_id: u64, join_timeout: Duration) -> Self {
        Self {
            gateway,
            guild_id,
            join_timeout,
        }
    }

    fn abandon(&self) {
        if let Err(e) = self.gateway.leave_voice(self.guild_id) {
            warn!(guild_id = self.guild_id, error = %e, "Failed to send voice leave");
        }
    }
}

fn non_zero(id: u64, what: &str) -> Result<NonZeroU64, VoiceError> {
    NonZeroU64::new(id).ok_or_else(|| VoiceError::Handshake(format!("{} id is zero", what)))
}

fn connection_info(creds: &VoiceCredentials) -> Result<ConnectionInfo, VoiceError> {
    Ok(ConnectionInfo {
        channel_id: Some(ChannelId::from(non_zero(creds.channel_id, "channel")?)),
        endpoint: creds.endpoint.clone(),
        guild_id: GuildId::from(non_zero(creds.guild_id, "guild")?),
        session_id: creds.session_id.clone(),
        token: creds.token.clone(),
        user_id: UserId::from(non_zero(creds.user_id, "user")?),
    })
}

#[async_trait]
impl VoiceBackend for SongbirdBackend {
    async fn join(&self, channel_id: u64) -> Result<Box<dyn VoiceConnection>, VoiceError> {
        if self.gateway.voice_channel_known(self.guild_id, channel_id) == Some(false) {
            return Err(VoiceError::UnknownChannel { channel_id });
        }

        let rx = self.gateway.request_voice(self.guild_id, channel_id)?;

        let creds = match tokio::time::timeout(self.join_timeout, rx).await {
            Ok(Ok(creds)) => creds,
            Ok(Err(_)) => {
                self.abandon();
                return Err(VoiceError::Handshake(
                    "voice handshake was superseded".to_string(),
                ));
            }
            Err(_) => {
                self.abandon();
                return Err(VoiceError::HandshakeTimeout { channel_id });
            }
        };

        let info = match connection_info(&creds) {
            Ok(info) => info,
            Err(e) => {
                self.abandon();
                return Err(e);
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        let mut driver = Driver::new(DriverConfig::default());
        for event in [
            CoreEvent::DriverConnect,
            CoreEvent::DriverReconnect,
            CoreEvent::DriverDisconnect,
        ] {
            driver.add_global_event(
                Event::Core(event),
                ConnectionWatcher {
                    channel_id,
                    alive: Arc::clone(&alive),
                },
            );
        }

        let connecting = driver.connect(info);
        let connect_alive = Arc::clone(&alive);
        tokio::spawn(async move {
            match connecting.await {
                Ok(()) => info!(channel_id, "Voice driver connected"),
                Err(e) => {
                    connect_alive.store(false, Ordering::Release);
                    warn!(channel_id, error = %e, "Voice driver failed to connect");
                }
            }
        });

        Ok(Box::new(SongbirdConnection {
            channel_id,
            guild_id: self.guild_id,
            gateway: self.gateway.clone(),
            alive,
            driver: Mutex::new(driver),
        }))
    }

    fn name(&self) -> &str {
        "songbird"
    }
}

struct SongbirdConnection {
    channel_id: u64,
    guild_id: u64,
    gateway: GatewayHandle,
    alive: Arc<AtomicBool>,
    driver: Mutex<Driver>,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn channel_id(&self) -> u64 {
        self.channel_id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
            && self.gateway.bot_voice_channel(self.guild_id) == Some(self.channel_id)
    }

    async fn play(&self, clip: &Path, notifier: PlaybackNotifier) -> Result<(), VoiceError> {
        let input: Input = FileInput::new(clip.to_path_buf()).into();
        let generation = notifier.generation();
        let once = Arc::new(StdMutex::new(Some(notifier)));

        let mut driver = self.driver.lock().await;
        let track = driver.play_only_input(input);

        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(
                    Event::Track(event),
                    TrackEndNotifier {
                        notifier: Arc::clone(&once),
                    },
                )
                .map_err(|e| VoiceError::Playback(e.to_string()))?;
        }

        debug!(clip = %clip.display(), generation, "Playback started");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), VoiceError> {
        {
            let mut driver = self.driver.lock().await;
            driver.stop();
            driver.leave();
        }
        self.gateway.leave_voice(self.guild_id)
    }
}

/// Follows the driver's link to the voice server.  songbird reconnects on
/// its own; only a disconnect it gave up on marks the connection dead.
struct ConnectionWatcher {
    channel_id: u64,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl VoiceEventHandler for ConnectionWatcher {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::DriverConnect(_) | EventContext::DriverReconnect(_) => {
                self.alive.store(true, Ordering::Release);
            }
            EventContext::DriverDisconnect(data) => {
                self.alive.store(false, Ordering::Release);
                match &data.reason {
                    Some(reason) => warn!(
                        channel_id = self.channel_id,
                        ?reason,
                        "Voice driver disconnected"
                    ),
                    None => debug!(channel_id = self.channel_id, "Voice driver left"),
                }
            }
            _ => {}
        }
        None
    }
}

/// Reports the end of one track.  End and Error share the notifier, so the
/// sequencer hears about each track exactly once.
struct TrackEndNotifier {
    notifier: Arc<StdMutex<Option<PlaybackNotifier>>>,
}

fn outcome_of(ctx: &EventContext<'_>) -> PlaybackOutcome {
    if let EventContext::Track(tracks) = ctx {
        for (state, _) in tracks.iter() {
            if let PlayMode::Errored(e) = &state.playing {
                return PlaybackOutcome::Failed(format!("{:?}", e));
            }
        }
    }
    PlaybackOutcome::Finished
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let notifier = self
            .notifier
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(notifier) = notifier {
            notifier.notify(outcome_of(ctx));
        }
        Some(Event::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> VoiceCredentials {
        VoiceCredentials {
            guild_id: 1000,
            channel_id: 70,
            user_id: 42,
            session_id: "sess".into(),
            endpoint: "voice.discord.media".into(),
            token: "vtoken".into(),
        }
    }

    #[test]
    fn builds_connection_info() {
        let info = connection_info(&creds()).unwrap();
        assert_eq!(info.channel_id, Some(ChannelId::from(NonZeroU64::new(70).unwrap())));
        assert_eq!(info.guild_id, GuildId::from(NonZeroU64::new(1000).unwrap()));
        assert_eq!(info.user_id, UserId::from(NonZeroU64::new(42).unwrap()));
        assert_eq!(info.endpoint, "voice.discord.media");
        assert_eq!(info.session_id, "sess");
    }

    #[test]
    fn zero_ids_are_rejected() {
        let mut c = creds();
        c.user_id = 0;
        assert!(matches!(
            connection_info(&c),
            Err(VoiceError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn connection_is_dead_once_gateway_reports_no_channel() {
        let (_gateway, handle) = crate::discord::DiscordGateway::new("token").unwrap();
        let conn = SongbirdConnection {
            channel_id: 70,
            guild_id: 1000,
            gateway: handle,
            alive: Arc::new(AtomicBool::new(true)),
            driver: Mutex::new(Driver::new(DriverConfig::default())),
        };
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn join_before_ready_fails_fast() {
        let (_gateway, handle) = crate::discord::DiscordGateway::new("token").unwrap();
        let backend = SongbirdBackend::new(handle, 1000, Duration::from_secs(1));
        assert!(matches!(
            backend.join(70).await.err(),
            Some(VoiceError::NotReady)
        ));
    }
}
