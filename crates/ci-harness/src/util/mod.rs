//! Small async helpers shared by the poll loops.

pub mod poll;

pub use poll::poll_until;
