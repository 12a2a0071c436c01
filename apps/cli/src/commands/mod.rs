//! Subcommand implementations.

pub mod train;
pub mod verify;
