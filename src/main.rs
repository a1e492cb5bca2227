//! Pagememo rendezvous and relay server
//!
//! Peers register their identity here. Direct-transport peers look each other
//! up and then talk over their own sockets; relay-transport peers send every
//! payload through this process.
//!
//! ```bash
//! pagememo-relay --listen 0.0.0.0:7878 -v
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pagememo_core::logging::LoggingBuilder;
use pagememo_core::RendezvousServer;
use tracing::info;

/// Pagememo rendezvous/relay server
#[derive(Parser, Debug)]
#[command(name = "pagememo-relay")]
#[command(version)]
#[command(about = "Rendezvous and relay server for Pagememo peers")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = pagememo_core::DEFAULT_RELAY_ADDRESS)]
    listen: String,

    /// Also write JSONL logs under this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn filter_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => pagememo_core::logging::DEFAULT_FILTER,
        1 => "pagememo=debug,pagememo_core=debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let logging = match &args.log_dir {
        Some(dir) => LoggingBuilder::new(dir, "relay"),
        None => LoggingBuilder::console("relay"),
    };
    logging
        .with_filter(filter_for(args.verbose))
        .init()
        .context("failed to install logging")?;

    let server = RendezvousServer::bind(&args.listen)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await;
    Ok(())
}
