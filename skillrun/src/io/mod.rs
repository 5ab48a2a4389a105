//! Side-effecting collaborators: configuration, processes, run artifacts,
//! event and transcript sinks, prompt rendering, and signal handling.

pub mod config;
pub mod events;
pub mod executor;
pub mod process;
pub mod prompt;
pub mod run_store;
pub mod signals;
pub mod transcript;
