mod batch;
mod cmd;
mod config;
mod error;
mod job;
mod k8s;
mod launcher;
mod logging;
mod monitor;
mod orchestrator;
mod render;
mod rendezvous;
mod util;

use anyhow::Result;
use clap::Parser;

use crate::config::Cli;
use crate::config::Commands;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => cmd::run_single(*run_args).await,
        Commands::Batch(batch_args) => cmd::run_batch_command(batch_args).await,
        Commands::Launch(launch_args) => cmd::run_launch(*launch_args).await,
    }
}
