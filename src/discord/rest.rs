//! Discord REST lookups used at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use tracing::debug;

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Voice channel types: GUILD_VOICE and GUILD_STAGE_VOICE.
const VOICE_CHANNEL_TYPES: [u8; 2] = [2, 13];

/// A channel of the configured guild.
#[derive(Debug, Clone, Deserialize)]
pub struct GuildChannel {
    #[serde(deserialize_with = "snowflake")]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: u8,
}

impl GuildChannel {
    pub fn is_voice(&self) -> bool {
        VOICE_CHANNEL_TYPES.contains(&self.channel_type)
    }
}

fn snowflake<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// List all channels of `guild_id` (`GET /guilds/{guild.id}/channels`).
pub async fn list_guild_channels(
    http: &reqwest::Client,
    token: &str,
    guild_id: u64,
) -> Result<Vec<GuildChannel>> {
    let url = format!("{}/guilds/{}/channels", DISCORD_API_BASE, guild_id);

    let resp = http
        .get(&url)
        .header("Authorization", format!("Bot {}", token))
        .send()
        .await
        .context("Failed to list guild channels")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Discord API error listing channels ({}): {}", status, body);
    }

    let channels: Vec<GuildChannel> = resp
        .json()
        .await
        .context("Failed to parse guild channel list")?;
    debug!(guild_id, count = channels.len(), "Fetched guild channels");
    Ok(channels)
}
