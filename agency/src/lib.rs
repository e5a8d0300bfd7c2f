//! Local-first orchestrator for AI coding agent runs.
//!
//! A "run" is one invocation's worth of durable state: a git worktree on a
//! dedicated branch, a setup script execution, and a tmux session running the
//! configured agent. The crate keeps the same split throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (repo identity, naming, run-id
//!   resolution, status derivation). No I/O.
//! - **[`io`]**: Side-effecting adapters (filesystem, processes, git, tmux,
//!   the on-disk store, the repo lock). Capabilities are traits so tests can
//!   substitute them.
//!
//! [`service`] implements the individual run steps and [`pipeline`] drives
//! them in their fixed order. [`runs`] reads runs back for listing commands.

pub mod core;
pub mod dirs;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod runs;
pub mod service;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
