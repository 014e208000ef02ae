use std::path::PathBuf;

use clap::Parser;

use crate::batch::DEFAULT_CONCURRENCY;
use crate::config::driver::DriverArgs;

#[derive(Parser, Debug, Clone)]
pub struct BatchArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file holding a list of test job specs"
    )]
    pub jobs: PathBuf,

    #[arg(long, default_value_t = DEFAULT_CONCURRENCY, help = "Jobs running at the same time")]
    pub concurrency: usize,

    #[command(flatten)]
    pub driver: DriverArgs,
}
