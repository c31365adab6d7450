use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use service_router::config::{Config, LogFormat, LogOutput, LoggingConfig};
use service_router::Router;

#[derive(Parser)]
#[command(name = "service-router")]
#[command(about = "Service registry, health-aware load balancer and reverse proxy")]
struct Args {
    #[arg(short, long, default_value = "config/router.toml")]
    config: String,

    /// Overrides server.host and server.port
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("service_router={},hyper=warn", level)));
    let writer = match logging.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn load_config(path: &str) -> Result<(Config, bool)> {
    if Path::new(path).exists() {
        Ok((Config::from_file_with_env(path).await?, true))
    } else {
        let mut config = Config::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok((config, false))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, from_file) = load_config(&args.config).await?;
    init_tracing(&config.logging, args.verbose);
    if from_file {
        info!("Loaded configuration from {}", args.config);
    } else {
        warn!("Configuration file {} not found, using defaults", args.config);
    }

    if let Some(bind) = args.bind {
        config.server.host = bind.ip().to_string();
        config.server.port = bind.port();
    }
    let shutdown_timeout = config.server.get_shutdown_timeout();

    info!("Starting service router");
    let source = from_file.then(|| PathBuf::from(&args.config));
    let router = Router::with_source(config, source).await?;
    router.start().await?;

    let shutdown = router.shutdown_token();
    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => warn!("Received CTRL+C, shutting down gracefully..."),
                Err(e) => error!("Failed to listen for CTRL+C: {}", e),
            }
        }
        _ = shutdown.cancelled() => {
            error!("Server stopped unexpectedly, shutting down");
        }
    }

    router.stop(shutdown_timeout).await?;
    info!("Service router shutdown complete");
    Ok(())
}
