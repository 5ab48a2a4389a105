//! Skill-driven agent runtime.
//!
//! A run takes a natural-language task, prefilters a directory of skill packs,
//! and drives a bounded turn loop in which a model picks actions (shell
//! commands, skill handoffs, MCP tool calls, finish). The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (prefilter, decoding, budgets,
//!   retry classification, self-handoff detection). No I/O.
//! - **[`io`]**: Side-effecting operations (config, processes, run artifacts,
//!   event and transcript sinks, prompts, signals).
//! - **[`llm`]** and **[`mcp`]**: external collaborators behind traits so tests
//!   can script them.
//!
//! [`scheduler`] and [`session`] orchestrate the pieces for the CLI.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod llm;
pub mod logging;
pub mod mcp;
pub mod scheduler;
pub mod session;
pub mod skills;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
