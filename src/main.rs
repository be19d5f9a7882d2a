use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use station_announcer::config::{self, ChannelRef, Config, LoggingConfig};
use station_announcer::departures::DepartureRegistry;
use station_announcer::discord::{self, rest, DiscordGateway};
use station_announcer::routes::RouteDirectory;
use station_announcer::server::{self, AppState};
use station_announcer::station::StationAudioResolver;
use station_announcer::voice::driver::SongbirdBackend;
use station_announcer::voice::{AnnouncementSequencer, SequencerOptions, VoiceSessionManager};

/// How long to wait for the gateway READY before giving up on startup.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "station-announcer")]
#[command(about = "Plays transit station announcements in a Discord voice channel")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "ANNOUNCER_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// HTTP port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Discord bot token
    #[arg(long, env = "DISCORD_BOT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Guild the bot announces in
    #[arg(long, env = "GUILD_ID")]
    guild_id: Option<u64>,

    /// Voice channel for routes that do not name one
    #[arg(long, env = "VOICE_CHANNEL_ID")]
    voice_channel_id: Option<u64>,

    /// Directory holding the station clips
    #[arg(long, env = "AUDIO_DIR")]
    audio_dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "station_announcer=debug"
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// CLI flags and environment win over the file.
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(token) = &self.token {
            config.discord.token = token.clone();
        }
        if let Some(guild_id) = self.guild_id {
            config.discord.guild_id = Some(guild_id);
        }
        if let Some(channel_id) = self.voice_channel_id {
            config.discord.voice_channel_id = Some(channel_id);
        }
        if let Some(dir) = &self.audio_dir {
            config.audio.dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    cli.apply(&mut config);

    init_tracing(&config.logging);
    info!(
        "Starting station-announcer v{} (config: {})",
        env!("CARGO_PKG_VERSION"),
        cli.config.display()
    );

    if let Err(problems) = config::validate(&config) {
        for problem in &problems {
            error!("Config: {}", problem);
        }
        anyhow::bail!("Invalid configuration ({} problem(s))", problems.len());
    }

    let guild_id = config.discord.guild_id.context("Guild id is not set")?;
    let join_timeout = config.discord.join_timeout()?;
    let playback_timeout = config.announce.playback_timeout()?;

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    let routes = Arc::new(resolve_routes(&config, guild_id).await?);
    for route in routes.iter() {
        info!(
            route = %route.id,
            channel_id = route.channel_id,
            stops = route.stops.len(),
            "Route loaded"
        );
    }

    let shutdown = CancellationToken::new();
    let (gateway, gateway_handle) = DiscordGateway::new(config.discord.token.clone())?;
    let gateway_task = discord::start(gateway, shutdown.clone());
    let bot_user = gateway_handle.wait_ready(READY_TIMEOUT).await?;
    info!(bot_user, guild_id, "Discord gateway ready");

    let backend = Arc::new(SongbirdBackend::new(gateway_handle, guild_id, join_timeout));
    let sessions = VoiceSessionManager::new(backend, Arc::clone(&routes));
    let resolver = StationAudioResolver::new(
        config.audio.dir.clone(),
        config.audio.extension.clone(),
        config.audio.final_clip.clone(),
    );
    let sequencer = AnnouncementSequencer::spawn(
        sessions,
        routes,
        resolver,
        SequencerOptions {
            disconnect_after_each_stop: config.announce.disconnect_after_each_stop,
            playback_timeout: Some(playback_timeout),
        },
    );

    let app = server::router(AppState {
        sequencer: Arc::clone(&sequencer),
        departures: Arc::new(DepartureRegistry::new()),
    });

    let addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutting down");
    sequencer.shutdown().await;
    shutdown.cancel();
    if let Err(e) = gateway_task.await {
        error!("Discord gateway task panicked: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if logging.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Build the route directory, looking channel names up through REST only
/// when some route uses one.
async fn resolve_routes(config: &Config, guild_id: u64) -> Result<RouteDirectory> {
    let needs_lookup = config
        .routes
        .iter()
        .any(|r| matches!(r.channel_ref(), Some(ChannelRef::Name(_))));

    let channels = if needs_lookup {
        let http = reqwest::Client::new();
        rest::list_guild_channels(&http, &config.discord.token, guild_id)
            .await
            .context("Failed to resolve voice channel names")?
    } else {
        Vec::new()
    };

    RouteDirectory::resolve(&config.routes, config.discord.voice_channel_id, &channels)
        .context("Invalid route configuration")
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
