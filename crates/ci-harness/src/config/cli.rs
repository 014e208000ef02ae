use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::batch::BatchArgs;
use crate::config::launch::LaunchArgs;
use crate::config::run::RunArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit one test job and wait for its verdict
    Run(Box<RunArgs>),
    /// Run a list of test jobs through a bounded worker pool
    Batch(BatchArgs),
    /// In-pod entry point: rendezvous, start the server, run the test case
    Launch(Box<LaunchArgs>),
}
