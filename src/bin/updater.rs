//! cns-updater: feeds holder documents into the commit engine.
//!
//! Reads one JSON holder per line from stdin. A blank line closes the open
//! serial; end of input closes it and exits.

use clap::Parser;
use cns_dns::commit::{self, CommitEngine, OpenOptions, DEFAULT_QUEUE_DEPTH};
use cns_dns::holder::{Holder, Naming};
use cns_dns::{store, telemetry, Config};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Commit holder updates to the record store.
#[derive(Parser, Debug)]
#[command(name = "cns-updater")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "cns-dns.toml")]
    config: PathBuf,

    /// Commit the first batch under this serial instead of a clock serial.
    #[arg(long)]
    serial: Option<u32>,

    /// Only close serials on blank lines and end of input.
    #[arg(long)]
    untimed: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    let store = store::connect(&config.store).await?;
    let naming = Naming {
        use_login: config.dns.use_login,
        use_alias: config.dns.use_alias,
    };
    let engine = CommitEngine::new(store, naming, config.dns.timers.serial_close_delay());

    let shutdown = CancellationToken::new();
    let (handle, task) = commit::spawn(engine, DEFAULT_QUEUE_DEPTH, shutdown.clone());

    let timed = !args.untimed;
    handle
        .open_serial(OpenOptions {
            serial: args.serial,
            timed,
        })
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accepted = 0usize;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            if let Some(serial) = handle.close_serial().await? {
                info!(serial, accepted, "committed batch");
            }
            handle
                .open_serial(OpenOptions {
                    serial: None,
                    timed,
                })
                .await?;
            continue;
        }

        match serde_json::from_str::<Holder>(line) {
            Ok(holder) => {
                handle.write(holder).await?;
                accepted += 1;
            }
            Err(e) => warn!(error = %e, "skipping malformed holder"),
        }
    }

    if let Some(serial) = handle.close_serial().await? {
        info!(serial, accepted, "committed final batch");
    }

    shutdown.cancel();
    drop(handle);
    let _ = task.await;
    Ok(())
}
