use clap::Parser;
use log::{error, info};
use server::client_manager::{SessionId, DEFAULT_ID_CEILING};
use server::config::{ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
use server::moderation::{PurgoMalum, DEFAULT_FILTER_URL};
use server::network::{Server, ServerMessage};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Authoritative flag game server")]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, env = "FLAGRUN_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "FLAGRUN_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Primary tick period in milliseconds
    #[arg(long, env = "FLAGRUN_FRAME_MS", default_value_t = 33)]
    frame_ms: u64,

    #[arg(long, env = "FLAGRUN_SECONDARY_MS", default_value_t = 66)]
    secondary_ms: u64,

    /// Roster and chat cooldown period in milliseconds
    #[arg(long, env = "FLAGRUN_ROSTER_MS", default_value_t = 1000)]
    roster_ms: u64,

    /// Skin broadcast period in milliseconds
    #[arg(long, env = "FLAGRUN_COSMETIC_MS", default_value_t = 10_000)]
    cosmetic_ms: u64,

    /// Profanity filter endpoint
    #[arg(long, env = "FLAGRUN_MODERATION_URL", default_value = DEFAULT_FILTER_URL)]
    moderation_url: String,

    #[arg(long, env = "FLAGRUN_MODERATION_TIMEOUT_MS", default_value_t = 5000)]
    moderation_timeout_ms: u64,

    /// Highest session id before the counter wraps
    #[arg(long, env = "FLAGRUN_MAX_SESSIONS", default_value_t = DEFAULT_ID_CEILING)]
    max_sessions: SessionId,

    /// Reap sessions that send no player state within this many primary ticks
    #[arg(long, env = "FLAGRUN_HANDSHAKE_TICKS")]
    handshake_ticks: Option<u32>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            frame_period: Duration::from_millis(args.frame_ms),
            secondary_period: Duration::from_millis(args.secondary_ms),
            roster_period: Duration::from_millis(args.roster_ms),
            cosmetic_period: Duration::from_millis(args.cosmetic_ms),
            moderation_url: args.moderation_url,
            moderation_timeout: Duration::from_millis(args.moderation_timeout_ms),
            id_ceiling: args.max_sessions,
            handshake_ticks: args.handshake_ticks,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    info!(
        "Starting server on {} (frame {:?}, roster {:?}, cosmetic {:?})",
        config.address(),
        config.frame_period,
        config.roster_period,
        config.cosmetic_period
    );

    let filter = PurgoMalum::new(config.moderation_url.clone(), config.moderation_timeout)?;
    let server = Server::bind(config, filter).await?;
    let shutdown = server.sender();
    let mut server_handle = tokio::spawn(server.run());

    let interrupted = tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        info!("Received Ctrl+C, shutting down gracefully...");
        let _ = shutdown.send(ServerMessage::Shutdown);
        let _ = server_handle.await;
    }

    Ok(())
}
