//! cns-dns binary entry point.

use clap::Parser;
use cns_dns::{store, telemetry, Config, DnsServer};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Authoritative DNS server for a VM fleet.
#[derive(Parser, Debug)]
#[command(name = "cns-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "cns-dns.toml")]
    config: PathBuf,
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                    _ = term.recv() => info!("terminate received"),
                }
                return;
            }
            Err(e) => error!(error = %e, "could not install SIGTERM handler"),
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.dns.listen_addr,
        my_name = %config.dns.my_name,
        "Starting cns-dns"
    );

    let store = store::connect(&config.store).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let server = DnsServer::new(config.dns, store);
    if let Err(e) = server.run(shutdown).await {
        error!("DNS server error: {}", e);
        return Err(e.into());
    }

    info!("cns-dns shutdown complete");
    Ok(())
}
