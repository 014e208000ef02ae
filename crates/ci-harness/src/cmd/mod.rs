//! Command layer - entry points for the harness subcommands

pub mod batch;
pub mod launch;
pub mod run;

pub use batch::run_batch_command;
pub use launch::run_launch;
pub use run::run_single;
