use std::error::Error;
use std::net::Ipv4Addr;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

use hdhomerun_bridge::{config, diag, CaptureAgent, CaptureConfig, ResponderAgent, ResponderConfig};

#[derive(Parser)]
#[command(name = "hdhomerun-bridge", version, about = "Bridges HDHomeRun discovery between two networks over a TCP tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the capture agent on the network of the HDHomeRun app.
    Capture {
        /// Host running the responder agent on the tuner's network.
        peer: String,

        /// TCP port of the responder's tunnel listener.
        #[arg(long, default_value_t = config::TUNNEL_PORT)]
        tunnel_port: u16,
    },
    /// Run the responder agent on the network of the tuner.
    Respond {
        /// Address to bind the tunnel listener to.
        #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
        bind: Ipv4Addr,

        /// TCP port to listen for the capture agent on.
        #[arg(long, default_value_t = config::TUNNEL_PORT)]
        tunnel_port: u16,
    },
    /// Decode discovery datagrams seen on the local network.
    Dump {
        /// UDP port to listen on.
        #[arg(long, default_value_t = config::DISCOVERY_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // DEBUG in the environment turns on verbose diagnostics; it never
    // affects protocol behavior.
    let level = if std::env::var_os("DEBUG").is_some() {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let filter_layer = filter::LevelFilter::from_level(level);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter_layer)
        .init();

    tokio::select! {
        res = run(cli.command) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("exiting");
            Ok(())
        }
    }
}

async fn run(command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Capture { peer, tunnel_port } => {
            let config = CaptureConfig {
                tunnel_port,
                ..CaptureConfig::default()
            };
            let agent = CaptureAgent::bind(peer, config).await?;
            agent.run().await?;
        }
        Command::Respond { bind, tunnel_port } => {
            let config = ResponderConfig {
                bind_addr: bind,
                tunnel_port,
                ..ResponderConfig::default()
            };
            let agent = ResponderAgent::bind(config).await?;
            agent.run().await?;
        }
        Command::Dump { port } => {
            diag::run_dump(port).await?;
        }
    }
    Ok(())
}
