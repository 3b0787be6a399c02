use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use voicemesh_lib::config::AppConfig;

#[derive(Parser)]
#[command(name = "voicemesh", about = "Peer-to-peer voice mesh")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the presence/signaling relay
    Relay {
        #[arg(long, default_value = "9850")]
        port: u16,
    },
    /// Run a voice node with the local control API
    Node {
        /// Relay websocket URL
        #[arg(long)]
        relay: Option<String>,

        /// Stable identity (random when omitted)
        #[arg(long)]
        identity: Option<String>,

        #[arg(long)]
        display_name: Option<String>,

        /// API server port
        #[arg(long)]
        port: Option<u16>,

        /// Config file (defaults to the platform config dir)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Relay { port } => rt.block_on(voicemesh_lib::run_relay(port)),
        Command::Node {
            relay,
            identity,
            display_name,
            port,
            config,
        } => {
            let mut app_config = match AppConfig::load(config.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            if let Some(relay) = relay {
                app_config.relay_url = relay;
            }
            if identity.is_some() {
                app_config.identity = identity;
            }
            if display_name.is_some() {
                app_config.display_name = display_name;
            }
            if let Some(port) = port {
                app_config.api_port = port;
            }
            rt.block_on(voicemesh_lib::run_node(app_config))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
