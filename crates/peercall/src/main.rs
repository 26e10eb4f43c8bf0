//! PeerCall
//!
//! Command-line endpoint for peer-to-peer calls.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use peercall::config::{default_config_path, Config};
use peercall::protocol::PeerId;
use peercall::{
    CallEvent, Coordinator, CoordinatorHandle, SyntheticCapture, WebRtcEngine, WebSocketTransport,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// PeerCall - peer-to-peer calls over a signaling server.
#[derive(Parser, Debug)]
#[command(name = "peercall")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Connect to the signaling server and wait for calls
    Run {
        /// Capture local media before calling or answering
        #[arg(long)]
        camera: bool,

        /// Call this peer as soon as it appears in the roster
        #[arg(long, value_name = "PEER")]
        call: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration to the config path
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    // Initialize tracing
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.node.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Run { camera, call } => {
            config.validate()?;
            run(config, camera, call.map(PeerId::from)).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// Runs a coordinator until Ctrl-C.
async fn run(config: Config, camera: bool, target: Option<PeerId>) -> anyhow::Result<()> {
    tracing::info!("PeerCall starting (signaling: {})", config.network.signaling_url);

    let handle = Coordinator::spawn(
        WebRtcEngine::new()?,
        Arc::new(WebSocketTransport::new(config.websocket())),
        Arc::new(SyntheticCapture::new()),
        config.coordinator_options(),
    )?;
    let mut events = handle.subscribe();

    if camera {
        let stream = handle.start_camera().await?;
        tracing::info!("Local media ready ({} tracks)", stream.tracks.len());
    }

    let mut pending_call = target;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => on_event(&handle, event, &mut pending_call).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event listener fell behind, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, hanging up");
                break;
            }
        }
    }

    handle.hangup().await?;
    handle.shutdown().await?;
    Ok(())
}

async fn on_event(handle: &CoordinatorHandle, event: CallEvent, pending_call: &mut Option<PeerId>) {
    match event {
        CallEvent::LocalId(id) => println!("Connected as {}", id),
        CallEvent::Roster(peers) => {
            let names: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
            println!("Online: [{}]", names.join(", "));

            if let Some(peer) = pending_call.take_if(|peer| peers.contains(peer)) {
                tracing::info!("Calling {}", peer);
                if let Err(e) = handle.start_call(peer).await {
                    tracing::error!("Failed to place call: {}", e);
                }
            }
        }
        CallEvent::OfferReceived { from } => println!("Incoming call from {}", from),
        CallEvent::Phase(phase) => println!("Call: {}", phase),
        CallEvent::ConnectionState(state) => println!("Connection: {:?}", state),
        CallEvent::Transport(state) => println!("Signaling: {:?}", state),
        CallEvent::RemoteTrack(track) => {
            println!("Remote {} track {}", track.kind.as_str(), track.id)
        }
        CallEvent::LocalStream(stream) => tracing::debug!("Local stream {}", stream.id),
        CallEvent::DataChannelOpen { label } => println!("Data channel '{}' open", label),
        CallEvent::DataChannelMessage { label, data } => {
            println!("[{}] {}", label, String::from_utf8_lossy(&data))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from(["peercall", "run"]).unwrap();
        match cli.command {
            Commands::Run { camera, call } => {
                assert!(!camera);
                assert!(call.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_camera_and_call() {
        let cli = Cli::try_parse_from(["peercall", "run", "--camera", "--call", "B"]).unwrap();
        match cli.command {
            Commands::Run { camera, call } => {
                assert!(camera);
                assert_eq!(call.as_deref(), Some("B"));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_call_requires_peer() {
        let result = Cli::try_parse_from(["peercall", "run", "--call"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::try_parse_from(["peercall", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::try_parse_from(["peercall", "config", "init", "-f"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_config_without_subcommand_fails() {
        let result = Cli::try_parse_from(["peercall", "config"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["peercall", "-v", "-c", "/tmp/peercall.toml", "run"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/peercall.toml")));
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli = Cli::try_parse_from(["peercall", "run", "--verbose", "--config", "peercall.toml"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("peercall.toml")));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        let result = Cli::try_parse_from(["peercall"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_help_available() {
        let result = Cli::try_parse_from(["peercall", "--help"]);
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::DisplayHelp
        );
    }
}
