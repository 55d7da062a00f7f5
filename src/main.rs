use clap::Parser;
use config::Config;
use mediarelay::server::RelayServer;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Preferred listen port (overrides config; falls back to an ephemeral
    /// port when occupied)
    #[arg(long)]
    port: Option<u16>,

    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[derive(Debug, Default, Deserialize)]
struct Settings {
    #[serde(default)]
    server: ServerConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ServerConfig {
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // The config file is optional; the relay runs fine on defaults.
    let settings: Settings = match Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .build()
    {
        Ok(c) => c.try_deserialize().unwrap_or_default(),
        Err(e) => {
            warn!("Ignoring unreadable config {}: {}", args.config, e);
            Settings::default()
        }
    };

    let preferred = args.port.or(settings.server.port);
    if let Some(p) = preferred {
        info!("Preferred port: {}", p);
    }

    let relay = RelayServer::new();
    let handle = relay.start(preferred).await?;
    info!("Media relay ready at {}", handle.origin());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
