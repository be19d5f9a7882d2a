//! Single voice session owner.
//!
//! Holds at most one live [`VoiceConnection`].  A request for a different
//! channel destroys the current connection before joining the next one.

use std::sync::Arc;

use tracing::{info, warn};

use super::{VoiceBackend, VoiceConnection};
use crate::error::{AnnounceError, VoiceError};
use crate::routes::RouteDirectory;

/// The live connection and what it was opened for.
pub struct VoiceSession {
    route_id: String,
    channel_id: u64,
    connection: Box<dyn VoiceConnection>,
}

impl VoiceSession {
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn connection(&self) -> &dyn VoiceConnection {
        self.connection.as_ref()
    }
}

/// Owns the process-wide voice session.
pub struct VoiceSessionManager {
    backend: Arc<dyn VoiceBackend>,
    routes: Arc<RouteDirectory>,
    session: Option<VoiceSession>,
}

impl VoiceSessionManager {
    pub fn new(backend: Arc<dyn VoiceBackend>, routes: Arc<RouteDirectory>) -> Self {
        Self {
            backend,
            routes,
            session: None,
        }
    }

    /// Make sure a session exists on the channel of `route_id`.
    ///
    /// Reuses the current session when it is still alive on that channel.
    pub async fn ensure_connected(
        &mut self,
        route_id: &str,
    ) -> Result<&VoiceSession, AnnounceError> {
        let route = self.routes.get(route_id)?;
        let channel_id = route.channel_id;
        let route_name = route.id.clone();

        let reuse = match &self.session {
            Some(s) if s.channel_id == channel_id => {
                let alive = s.connection.is_alive();
                if !alive {
                    warn!(
                        route = %s.route_id,
                        channel_id,
                        "Voice session dropped from outside, rejoining"
                    );
                }
                alive
            }
            _ => false,
        };

        if !reuse {
            self.teardown().await;

            info!(
                route = %route_name,
                channel_id,
                backend = self.backend.name(),
                "Joining voice channel"
            );
            let connection = self.backend.join(channel_id).await.map_err(|e| {
                warn!(route = %route_name, channel_id, error = %e, "Voice join failed");
                match e {
                    VoiceError::UnknownChannel { .. } => {
                        AnnounceError::ChannelNotFound(route_name.clone())
                    }
                    e => AnnounceError::from(e),
                }
            })?;

            self.session = Some(VoiceSession {
                route_id: route_name,
                channel_id,
                connection,
            });
        }

        self.session
            .as_ref()
            .ok_or_else(|| AnnounceError::Internal("voice session vanished".to_string()))
    }

    /// Destroy the current session, if any.  Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        info!(
            route = %session.route_id,
            channel_id = session.channel_id,
            "Leaving voice channel"
        );
        if let Err(e) = session.connection.disconnect().await {
            warn!(
                channel_id = session.channel_id,
                error = %e,
                "Failed to disconnect cleanly, dropping session anyway"
            );
        }
    }

    pub fn current(&self) -> Option<&VoiceSession> {
        self.session.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}
