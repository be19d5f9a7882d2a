//! Configuration loaded from `announcer.toml`, overridden by CLI/env.

mod schema;

pub use schema::{parse_duration, validate};

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "announcer.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub discord: DiscordConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub announce: AnnounceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Clone, Deserialize)]
pub struct DiscordConfig {
    /// Bot token. Usually supplied through `DISCORD_BOT_TOKEN`.
    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub guild_id: Option<u64>,

    /// Channel used by routes that do not name one.
    #[serde(default)]
    pub voice_channel_id: Option<u64>,

    /// Upper bound on the gateway voice handshake, e.g. `"10s"`.
    #[serde(default = "default_join_timeout")]
    pub join_timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_audio_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_audio_extension")]
    pub extension: String,

    /// File name of the end-of-line clip inside `dir`.
    #[serde(default = "default_final_clip")]
    pub final_clip: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnounceConfig {
    /// Leave the channel after every stop instead of only at the end of the line.
    #[serde(default)]
    pub disconnect_after_each_stop: bool,

    /// Give up on a clip that never reports completion, e.g. `"5m"`.
    #[serde(default = "default_playback_timeout")]
    pub playback_timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `"info"` or `"station_announcer=debug,info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

/// One `[[routes]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    /// Voice channel name, resolved against the guild at startup.
    #[serde(default)]
    pub channel: Option<String>,

    #[serde(default)]
    pub channel_id: Option<u64>,

    pub stops: Vec<String>,
}

/// How a route points at its voice channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRef<'a> {
    Id(u64),
    Name(&'a str),
}

impl RouteConfig {
    /// An explicit id wins over a name.
    pub fn channel_ref(&self) -> Option<ChannelRef<'_>> {
        if let Some(id) = self.channel_id {
            return Some(ChannelRef::Id(id));
        }
        self.channel
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(ChannelRef::Name)
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    3000
}

fn default_join_timeout() -> String {
    "10s".to_string()
}

fn default_audio_dir() -> PathBuf {
    PathBuf::from("audio")
}

fn default_audio_extension() -> String {
    "mp3".to_string()
}

fn default_final_clip() -> String {
    "last_station.mp3".to_string()
}

fn default_playback_timeout() -> String {
    "5m".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            guild_id: None,
            voice_channel_id: None,
            join_timeout: default_join_timeout(),
        }
    }
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("token", &"[REDACTED]")
            .field("guild_id", &self.guild_id)
            .field("voice_channel_id", &self.voice_channel_id)
            .field("join_timeout", &self.join_timeout)
            .finish()
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            dir: default_audio_dir(),
            extension: default_audio_extension(),
            final_clip: default_final_clip(),
        }
    }
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            disconnect_after_each_stop: false,
            playback_timeout: default_playback_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DiscordConfig {
    pub fn join_timeout(&self) -> Result<Duration> {
        parse_duration(&self.join_timeout)
            .map_err(anyhow::Error::msg)
            .context("invalid discord.join_timeout")
    }
}

impl AnnounceConfig {
    pub fn playback_timeout(&self) -> Result<Duration> {
        parse_duration(&self.playback_timeout)
            .map_err(anyhow::Error::msg)
            .context("invalid announce.playback_timeout")
    }
}

impl Config {
    /// Parse a configuration document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration")
    }

    /// Load from `path`. A missing file yields the defaults so that a
    /// deployment can be configured entirely through the environment.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }
}
