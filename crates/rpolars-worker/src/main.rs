//! rpolars worker process.
//!
//! Spawned by the worker pool with the path of a rendezvous socket. Announces
//! its job channel there, then evaluates host callbacks until the pool closes
//! the channel.

use std::path::PathBuf;

use clap::Parser;
use rpolars_bg::{BuiltinHost, ipc::run_worker};

#[derive(Parser)]
#[command(name = "rpolars-worker")]
#[command(about = "Worker process for rpolars background jobs")]
#[command(version)]
struct Args {
    /// Rendezvous socket to announce on
    rendezvous: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Stdout is not ours; logs go to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_env("RPOLARS_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    run_worker(&args.rendezvous, &BuiltinHost)
        .map_err(|err| anyhow::anyhow!("worker {} failed:\n{}", std::process::id(), err))
}
