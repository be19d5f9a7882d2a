//! Minimal Discord gateway client.
//!
//! Keeps one gateway session alive (IDENTIFY / heartbeat / RESUME with
//! exponential backoff) and performs the voice handshake songbird needs:
//! send a Voice State Update (op 4), then collect our own
//! `VOICE_STATE_UPDATE` (session id) and the matching `VOICE_SERVER_UPDATE`
//! (endpoint + token).

pub mod rest;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use dashmap::{DashMap, DashSet};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{self, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::VoiceError;
use rest::GuildChannel;

const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

// Gateway opcodes
const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_VOICE_STATE_UPDATE: u8 = 4;
const OP_RESUME: u8 = 6;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

/// Intents: GUILDS (1<<0) + GUILD_VOICE_STATES (1<<7)
const INTENTS: u64 = 129;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// ─── Gateway payloads ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    d: Option<serde_json::Value>,
    s: Option<u64>,
    t: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayCommand {
    op: u8,
    d: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct HelloData {
    heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
struct ReadyData {
    session_id: String,
    resume_gateway_url: String,
    user: ReadyUser,
}

#[derive(Debug, Deserialize)]
struct ReadyUser {
    id: String,
    username: String,
}

#[derive(Debug, Clone, Deserialize)]
struct VoiceStateData {
    guild_id: Option<String>,
    channel_id: Option<String>,
    user_id: String,
    session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct VoiceServerData {
    token: String,
    guild_id: String,
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GuildCreateData {
    id: String,
    #[serde(default)]
    channels: Vec<GuildChannel>,
}

#[derive(Debug, Deserialize)]
struct ChannelEventData {
    #[serde(flatten)]
    channel: GuildChannel,
    guild_id: Option<String>,
}

/// Discord ids travel as decimal strings.
pub fn parse_snowflake(s: &str) -> Option<u64> {
    s.parse().ok().filter(|id| *id != 0)
}

fn voice_state_command(guild_id: u64, channel_id: Option<u64>) -> GatewayCommand {
    GatewayCommand {
        op: OP_VOICE_STATE_UPDATE,
        d: serde_json::json!({
            "guild_id": guild_id.to_string(),
            "channel_id": channel_id.map(|c| c.to_string()),
            "self_mute": false,
            "self_deaf": true
        }),
    }
}

// ─── Voice handshake ────────────────────────────────────────────────

/// Everything the voice driver needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCredentials {
    pub guild_id: u64,
    pub channel_id: u64,
    pub user_id: u64,
    pub session_id: String,
    pub endpoint: String,
    pub token: String,
}

struct PendingJoin {
    guild_id: u64,
    channel_id: u64,
    user_id: u64,
    session_id: Option<String>,
    server: Option<(String, String)>,
    tx: oneshot::Sender<VoiceCredentials>,
}

/// Collects the two halves of a voice handshake.  One join in flight at a
/// time; starting a new one drops the previous waiter.
#[derive(Default)]
struct VoiceHandshake {
    pending: Option<PendingJoin>,
}

impl VoiceHandshake {
    fn begin(
        &mut self,
        guild_id: u64,
        channel_id: u64,
        user_id: u64,
    ) -> oneshot::Receiver<VoiceCredentials> {
        let (tx, rx) = oneshot::channel();
        self.pending = Some(PendingJoin {
            guild_id,
            channel_id,
            user_id,
            session_id: None,
            server: None,
            tx,
        });
        rx
    }

    fn cancel(&mut self, guild_id: u64) {
        if self.pending.as_ref().is_some_and(|p| p.guild_id == guild_id) {
            self.pending = None;
        }
    }

    fn on_voice_state(&mut self, data: &VoiceStateData) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };
        let guild = data.guild_id.as_deref().and_then(parse_snowflake);
        let channel = data.channel_id.as_deref().and_then(parse_snowflake);
        if parse_snowflake(&data.user_id) != Some(pending.user_id)
            || guild != Some(pending.guild_id)
            || channel != Some(pending.channel_id)
        {
            return false;
        }
        pending.session_id = Some(data.session_id.clone());
        self.try_complete()
    }

    fn on_voice_server(&mut self, data: &VoiceServerData) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };
        if parse_snowflake(&data.guild_id) != Some(pending.guild_id) {
            return false;
        }
        // A null endpoint means the voice server is being reallocated;
        // another VOICE_SERVER_UPDATE follows.
        let Some(endpoint) = data.endpoint.clone() else {
            return false;
        };
        pending.server = Some((endpoint, data.token.clone()));
        self.try_complete()
    }

    fn try_complete(&mut self) -> bool {
        let ready = self
            .pending
            .as_ref()
            .is_some_and(|p| p.session_id.is_some() && p.server.is_some());
        if !ready {
            return false;
        }
        let Some(PendingJoin {
            guild_id,
            channel_id,
            user_id,
            session_id: Some(session_id),
            server: Some((endpoint, token)),
            tx,
        }) = self.pending.take()
        else {
            return false;
        };

        tx.send(VoiceCredentials {
            guild_id,
            channel_id,
            user_id,
            session_id,
            endpoint,
            token,
        })
        .is_ok()
    }
}

// ─── Voice channel cache ────────────────────────────────────────────

/// Voice channels seen through GUILD_CREATE and the CHANNEL_* events.
#[derive(Default)]
struct VoiceChannelCache {
    loaded_guilds: DashSet<u64>,
    /// channel id → guild id
    channels: DashMap<u64, u64>,
}

impl VoiceChannelCache {
    fn load_guild(&self, guild_id: u64, channels: &[GuildChannel]) {
        self.channels.retain(|_, guild| *guild != guild_id);
        for channel in channels.iter().filter(|c| c.is_voice()) {
            self.channels.insert(channel.id, guild_id);
        }
        self.loaded_guilds.insert(guild_id);
    }

    fn upsert(&self, guild_id: u64, channel: &GuildChannel) {
        if channel.is_voice() {
            self.channels.insert(channel.id, guild_id);
        } else {
            self.channels.remove(&channel.id);
        }
    }

    fn remove(&self, channel_id: u64) {
        self.channels.remove(&channel_id);
    }

    /// `None` until the guild itself has been received.
    fn contains(&self, guild_id: u64, channel_id: u64) -> Option<bool> {
        if !self.loaded_guilds.contains(&guild_id) {
            return None;
        }
        Some(
            self.channels
                .get(&channel_id)
                .is_some_and(|guild| *guild == guild_id),
        )
    }
}

// ─── Handle ─────────────────────────────────────────────────────────

/// Cloneable handle used by the voice backend to talk to the gateway task.
#[derive(Clone)]
pub struct GatewayHandle {
    commands: mpsc::UnboundedSender<GatewayCommand>,
    handshake: Arc<StdMutex<VoiceHandshake>>,
    voice_channels: Arc<VoiceChannelCache>,
    bot_voice: Arc<DashMap<u64, u64>>,
    bot_user: watch::Receiver<Option<u64>>,
}

impl GatewayHandle {
    /// Our own user id, once READY has been received.
    pub fn bot_user_id(&self) -> Option<u64> {
        *self.bot_user.borrow()
    }

    /// Whether `channel_id` is a voice channel of `guild_id`, or `None`
    /// while the guild has not been received yet.
    pub fn voice_channel_known(&self, guild_id: u64, channel_id: u64) -> Option<bool> {
        self.voice_channels.contains(guild_id, channel_id)
    }

    /// The voice channel Discord last reported us in, per our own
    /// `VOICE_STATE_UPDATE`s.  `None` after a leave, kick or channel delete.
    pub fn bot_voice_channel(&self, guild_id: u64) -> Option<u64> {
        self.bot_voice.get(&guild_id).map(|c| *c)
    }

    /// Wait for READY.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<u64> {
        let mut rx = self.bot_user.clone();
        let id = time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .context("Timed out waiting for Discord gateway READY")?
            .context("Discord gateway task stopped")?;
        (*id).context("Discord gateway READY without user id")
    }

    fn handshake(&self) -> std::sync::MutexGuard<'_, VoiceHandshake> {
        self.handshake.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, command: GatewayCommand) -> Result<(), VoiceError> {
        self.commands
            .send(command)
            .map_err(|_| VoiceError::Handshake("gateway task is not running".to_string()))
    }

    /// Ask Discord to move us into `channel_id`.
    ///
    /// The receiver resolves once both voice updates have arrived.
    pub fn request_voice(
        &self,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<oneshot::Receiver<VoiceCredentials>, VoiceError> {
        let user_id = self.bot_user_id().ok_or(VoiceError::NotReady)?;
        let rx = self.handshake().begin(guild_id, channel_id, user_id);
        self.send(voice_state_command(guild_id, Some(channel_id)))?;
        debug!(guild_id, channel_id, "Sent voice state update");
        Ok(rx)
    }

    /// Leave voice in `guild_id` and forget any handshake in flight.
    pub fn leave_voice(&self, guild_id: u64) -> Result<(), VoiceError> {
        self.handshake().cancel(guild_id);
        self.send(voice_state_command(guild_id, None))
    }
}

// ─── Gateway task ───────────────────────────────────────────────────

struct SessionState {
    sequence: Arc<AtomicU64>,
    session_id: Option<String>,
    resume_url: Option<String>,
}

impl SessionState {
    fn last_sequence(&self) -> Option<u64> {
        match self.sequence.load(Ordering::Acquire) {
            0 => None,
            s => Some(s),
        }
    }
}

pub struct DiscordGateway {
    token: String,
    commands_rx: Option<mpsc::UnboundedReceiver<GatewayCommand>>,
    handshake: Arc<StdMutex<VoiceHandshake>>,
    voice_channels: Arc<VoiceChannelCache>,
    bot_voice: Arc<DashMap<u64, u64>>,
    bot_user_tx: watch::Sender<Option<u64>>,
}

impl DiscordGateway {
    pub fn new(token: impl Into<String>) -> Result<(Self, GatewayHandle)> {
        let token = token.into();
        if token.trim().is_empty() {
            anyhow::bail!("Discord bot token is empty");
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (bot_user_tx, bot_user_rx) = watch::channel(None);
        let handshake = Arc::new(StdMutex::new(VoiceHandshake::default()));
        let voice_channels = Arc::new(VoiceChannelCache::default());
        let bot_voice = Arc::new(DashMap::new());

        let handle = GatewayHandle {
            commands: commands_tx,
            handshake: Arc::clone(&handshake),
            voice_channels: Arc::clone(&voice_channels),
            bot_voice: Arc::clone(&bot_voice),
            bot_user: bot_user_rx,
        };
        let gateway = Self {
            token,
            commands_rx: Some(commands_rx),
            handshake,
            voice_channels,
            bot_voice,
            bot_user_tx,
        };
        Ok((gateway, handle))
    }

    /// Run the gateway with automatic reconnect and exponential backoff
    /// until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let mut commands = self
            .commands_rx
            .take()
            .context("gateway already running; run() called twice?")?;

        let mut backoff_secs = 1u64;
        let max_backoff = 60u64;
        let mut state = SessionState {
            sequence: Arc::new(AtomicU64::new(0)),
            session_id: None,
            resume_url: None,
        };

        while !shutdown.is_cancelled() {
            let url = state
                .resume_url
                .as_deref()
                .unwrap_or(GATEWAY_URL)
                .to_string();

            match self
                .connect_and_run(&url, &mut state, &mut commands, &shutdown)
                .await
            {
                Ok(()) => {
                    info!("Discord gateway closed normally");
                    break;
                }
                Err(e) => {
                    error!("Discord gateway error: {:#}", e);
                    info!("Reconnecting in {} seconds...", backoff_secs);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(max_backoff);
                }
            }
        }

        Ok(())
    }

    async fn connect_and_run(
        &self,
        url: &str,
        state: &mut SessionState,
        commands: &mut mpsc::UnboundedReceiver<GatewayCommand>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (ws, _) = connect_async(url)
            .await
            .context("Failed to connect to Discord gateway")?;
        info!("Connected to Discord gateway");

        let (sink, mut stream) = ws.split();
        let sink = Arc::new(Mutex::new(sink));

        let heartbeat_interval = self.wait_for_hello(&mut stream).await?;
        info!(
            "Received HELLO, heartbeat interval: {}ms",
            heartbeat_interval
        );

        match (state.session_id.clone(), state.last_sequence()) {
            (Some(sid), Some(seq)) => {
                self.send_resume(&sink, &sid, seq).await?;
                info!("Sent RESUME for session {}", sid);
            }
            _ => {
                self.send_identify(&sink).await?;
                info!("Sent IDENTIFY");
            }
        }

        let hb_sink = Arc::clone(&sink);
        let hb_sequence = Arc::clone(&state.sequence);
        let heartbeat_handle = tokio::spawn(async move {
            Self::heartbeat_loop(hb_sink, heartbeat_interval, hb_sequence).await;
        });

        let result = self
            .event_loop(&mut stream, &sink, state, commands, shutdown)
            .await;

        heartbeat_handle.abort();
        if shutdown.is_cancelled() {
            let _ = sink.lock().await.send(WsMessage::Close(None)).await;
        }
        result
    }

    async fn wait_for_hello(&self, stream: &mut WsStream) -> Result<u64> {
        while let Some(msg) = stream.next().await {
            let msg = msg?;
            if let WsMessage::Text(text) = msg {
                let payload: GatewayPayload = serde_json::from_str(&text)?;
                if payload.op == OP_HELLO {
                    let hello: HelloData = serde_json::from_value(
                        payload.d.context("HELLO payload missing data")?,
                    )?;
                    return Ok(hello.heartbeat_interval);
                }
            }
        }
        anyhow::bail!("Gateway closed before sending HELLO")
    }

    async fn send_command(sink: &Arc<Mutex<WsSink>>, command: &GatewayCommand) -> Result<()> {
        let text = serde_json::to_string(command)?;
        sink.lock().await.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn send_identify(&self, sink: &Arc<Mutex<WsSink>>) -> Result<()> {
        let identify = GatewayCommand {
            op: OP_IDENTIFY,
            d: serde_json::json!({
                "token": self.token,
                "intents": INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "station-announcer",
                    "device": "station-announcer"
                }
            }),
        };
        Self::send_command(sink, &identify).await
    }

    async fn send_resume(
        &self,
        sink: &Arc<Mutex<WsSink>>,
        session_id: &str,
        sequence: u64,
    ) -> Result<()> {
        let resume = GatewayCommand {
            op: OP_RESUME,
            d: serde_json::json!({
                "token": self.token,
                "session_id": session_id,
                "seq": sequence
            }),
        };
        Self::send_command(sink, &resume).await
    }

    async fn heartbeat_loop(sink: Arc<Mutex<WsSink>>, interval_ms: u64, sequence: Arc<AtomicU64>) {
        // Jitter: first heartbeat at interval / 2, then every interval
        let jitter_ms = interval_ms / 2;
        time::sleep(Duration::from_millis(jitter_ms)).await;

        let mut ticker = time::interval(Duration::from_millis(interval_ms));
        loop {
            ticker.tick().await;
            let seq = match sequence.load(Ordering::Acquire) {
                0 => None,
                s => Some(s),
            };
            let hb = GatewayCommand {
                op: OP_HEARTBEAT,
                d: serde_json::json!(seq),
            };
            if let Err(e) = Self::send_command(&sink, &hb).await {
                warn!("Failed to send heartbeat: {}", e);
                break;
            }
            debug!("Sent heartbeat");
        }
    }

    async fn event_loop(
        &self,
        stream: &mut WsStream,
        sink: &Arc<Mutex<WsSink>>,
        state: &mut SessionState,
        commands: &mut mpsc::UnboundedReceiver<GatewayCommand>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Flush queued voice leaves before closing.
                    while let Ok(command) = commands.try_recv() {
                        Self::send_command(sink, &command).await?;
                    }
                    info!("Discord gateway shutting down");
                    return Ok(());
                }
                Some(command) = commands.recv() => {
                    Self::send_command(sink, &command).await?;
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(anyhow::anyhow!("Stream ended"));
                    };
                    match msg? {
                        WsMessage::Text(text) => {
                            self.handle_payload(&text, sink, state).await?;
                        }
                        WsMessage::Close(frame) => {
                            info!("WebSocket closed: {:?}", frame);
                            return Err(anyhow::anyhow!("WebSocket closed"));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_payload(
        &self,
        text: &str,
        sink: &Arc<Mutex<WsSink>>,
        state: &mut SessionState,
    ) -> Result<()> {
        let payload: GatewayPayload = serde_json::from_str(text)?;

        if let Some(s) = payload.s {
            state.sequence.store(s, Ordering::Release);
        }

        match payload.op {
            OP_DISPATCH => {
                if let Some(ref event_name) = payload.t {
                    self.handle_dispatch(event_name, payload.d, state);
                }
            }
            OP_HEARTBEAT => {
                // Server requesting immediate heartbeat
                let hb = GatewayCommand {
                    op: OP_HEARTBEAT,
                    d: serde_json::json!(state.last_sequence()),
                };
                Self::send_command(sink, &hb).await?;
            }
            OP_RECONNECT => {
                info!("Received RECONNECT, will reconnect");
                return Err(anyhow::anyhow!("Server requested reconnect"));
            }
            OP_INVALID_SESSION => {
                let resumable = payload.d.and_then(|v| v.as_bool()).unwrap_or(false);
                if !resumable {
                    info!("Invalid session (not resumable), resetting state");
                    state.session_id = None;
                    state.resume_url = None;
                    state.sequence.store(0, Ordering::Release);
                }
                return Err(anyhow::anyhow!("Invalid session"));
            }
            OP_HEARTBEAT_ACK => {
                debug!("Heartbeat ACK received");
            }
            _ => {
                debug!("Unhandled opcode: {}", payload.op);
            }
        }
        Ok(())
    }

    fn handle_dispatch(
        &self,
        event_name: &str,
        data: Option<serde_json::Value>,
        state: &mut SessionState,
    ) {
        let Some(d) = data else {
            return;
        };
        match event_name {
            "READY" => match serde_json::from_value::<ReadyData>(d) {
                Ok(ready) => {
                    info!(
                        "READY: logged in as {} ({})",
                        ready.user.username, ready.user.id
                    );
                    state.session_id = Some(ready.session_id);
                    state.resume_url = Some(ready.resume_gateway_url);
                    self.bot_user_tx
                        .send_replace(parse_snowflake(&ready.user.id));
                }
                Err(e) => error!("Failed to parse READY: {}", e),
            },
            "VOICE_STATE_UPDATE" => match serde_json::from_value::<VoiceStateData>(d) {
                Ok(vs) => {
                    self.track_own_voice_state(&vs);
                    let mut handshake = self.handshake.lock().unwrap_or_else(|e| e.into_inner());
                    if handshake.on_voice_state(&vs) {
                        info!(channel_id = ?vs.channel_id, "Voice handshake complete");
                    }
                }
                Err(e) => error!("Failed to parse VOICE_STATE_UPDATE: {}", e),
            },
            "VOICE_SERVER_UPDATE" => match serde_json::from_value::<VoiceServerData>(d) {
                Ok(vs) => {
                    let mut handshake = self.handshake.lock().unwrap_or_else(|e| e.into_inner());
                    if handshake.on_voice_server(&vs) {
                        info!(endpoint = ?vs.endpoint, "Voice handshake complete");
                    }
                }
                Err(e) => error!("Failed to parse VOICE_SERVER_UPDATE: {}", e),
            },
            "GUILD_CREATE" => match serde_json::from_value::<GuildCreateData>(d) {
                Ok(guild) => {
                    if let Some(guild_id) = parse_snowflake(&guild.id) {
                        self.voice_channels.load_guild(guild_id, &guild.channels);
                        debug!(guild_id, channels = guild.channels.len(), "Guild available");
                    }
                }
                Err(e) => error!("Failed to parse GUILD_CREATE: {}", e),
            },
            "CHANNEL_CREATE" | "CHANNEL_UPDATE" | "CHANNEL_DELETE" => {
                match serde_json::from_value::<ChannelEventData>(d) {
                    Ok(ev) => {
                        let guild_id = ev.guild_id.as_deref().and_then(parse_snowflake);
                        match (event_name, guild_id) {
                            ("CHANNEL_DELETE", _) => {
                                self.voice_channels.remove(ev.channel.id)
                            }
                            (_, Some(guild_id)) => {
                                self.voice_channels.upsert(guild_id, &ev.channel)
                            }
                            (_, None) => {}
                        }
                    }
                    Err(e) => debug!("Ignoring {}: {}", event_name, e),
                }
            }
            "RESUMED" => {
                info!("Session resumed successfully");
            }
            _ => {
                debug!("Unhandled event: {}", event_name);
            }
        }
    }

    fn track_own_voice_state(&self, vs: &VoiceStateData) {
        let own = *self.bot_user_tx.borrow();
        if own.is_none() || parse_snowflake(&vs.user_id) != own {
            return;
        }
        let Some(guild_id) = vs.guild_id.as_deref().and_then(parse_snowflake) else {
            return;
        };
        match vs.channel_id.as_deref().and_then(parse_snowflake) {
            Some(channel_id) => {
                self.bot_voice.insert(guild_id, channel_id);
            }
            None => {
                if self.bot_voice.remove(&guild_id).is_some() {
                    info!(guild_id, "Bot left voice");
                }
            }
        }
    }
}

/// Start the gateway as a background task.
/// Returns the JoinHandle so the caller can await it on shutdown.
pub fn start(
    mut gateway: DiscordGateway,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    info!("Starting Discord gateway");
    tokio::spawn(async move {
        if let Err(e) = gateway.run(shutdown).await {
            error!("Discord gateway exited with error: {:#}", e);
        }
    })
}
