//! I/O adapters for agency commands.

pub mod atomic;
pub mod config;
pub mod fs;
pub mod git;
pub mod lock;
pub mod process;
pub mod store;
pub mod tmux;
