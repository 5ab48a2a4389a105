//! Deterministic, pure logic shared by the scheduler.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod command;
pub mod decoder;
pub mod fuzzy;
pub mod handoff;
pub mod payload;
pub mod prefilter;
pub mod redaction;
pub mod retry;
pub mod types;
