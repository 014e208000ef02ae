pub mod batch;
pub mod cli;
pub mod driver;
pub mod launch;
pub mod run;

pub use batch::*;
pub use cli::*;
pub use driver::*;
pub use launch::*;
pub use run::*;
