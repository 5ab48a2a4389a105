//! Stable exit codes for skillrun CLI commands.

/// Command succeeded (or the run finished successfully).
pub const OK: i32 = 0;
/// A run finished with status `failed`.
pub const RUN_FAILED: i32 = 1;
/// Invalid config, arguments, or an infrastructure error.
pub const INVALID: i32 = 2;
/// A second interrupt signal arrived while a run was stopping.
pub const INTERRUPTED: i32 = 130;
