//! AINP broker daemon.
//!
//! The broker exposes:
//! - REST endpoints for registration, discovery, intents, negotiations,
//!   mail, usefulness proofs, receipts, and payments
//! - a WebSocket session endpoint bridging durable streams to live agents
//! - background sweeps for expiry, cache refresh, and finalization

use ainp_server::{BrokerConfig, DaemonError, Server};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// AINP broker CLI.
#[derive(Parser)]
#[command(name = "ainpd")]
#[command(about = "AINP broker - semantic network broker for AI agents", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AINP_CONFIG")]
    config: Option<String>,

    /// Listen address
    #[arg(short, long, env = "AINP_LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level
    #[arg(long, env = "AINP_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "AINP_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config =
        BrokerConfig::load(cli.config.as_deref()).map_err(|e| DaemonError::Config(e.to_string()))?;

    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| DaemonError::Config(format!("invalid listen address: {e}")))?;
    }

    println!(
        r#"
    _    ___ _   _ ____
   / \  |_ _| \ | |  _ \
  / _ \  | ||  \| | |_) |
 / ___ \ | || |\  |  __/
/_/   \_\___|_| \_|_|

  AINP Broker - semantic network for AI agents
  Version: {}
  Listening: {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.server.listen_addr
    );

    let server = Server::new(config).await?;
    server.run().await
}
