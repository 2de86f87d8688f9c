pub mod block_number;
pub mod cache;
pub mod config;
pub mod confighub;
pub mod identity;
pub mod jsonrpc;
pub mod proxy;
pub mod server;
pub mod signature;

use std::path::PathBuf;

use clap::Parser;
use eyre::eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use self::config::Config;
use self::identity::Identity;
use self::proxy::Supervisor;
use self::server::start_servers;

/// This service receives orderflow from users and peer builders, forwards it
/// to the local builder, fans it out to the network, and archives it.
#[derive(Parser, Debug)]
#[clap(name = "Orderflow Proxy")]
#[clap(version)]
struct Opts {
    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Set to disable colors in the logs
    #[clap(long)]
    no_ansi: bool,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    eyre::install()?;
    dotenv::dotenv().ok();

    let opts = Opts::parse();

    let config = Config::load(opts.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(!opts.no_ansi)
                .compact(),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!(?config, "Starting orderflow proxy");

    run(config).await
}

pub async fn run(config: Config) -> Result<()> {
    let identity = Identity::generate(config.cert_valid_days, &config.cert_hosts)?;
    tracing::info!(address = %identity.address(), "Generated orderflow identity");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    // Registration must succeed before the listeners open; without published
    // credentials nobody can authenticate us.
    let supervisor = Supervisor::start(&config, &identity, cancel.clone()).await?;
    let servers = start_servers(&config, &identity, supervisor.proxy.clone()).await?;

    cancel.cancelled().await;
    tracing::info!("Shutting down");

    servers.shutdown().await;
    supervisor.flush_archive();
    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
