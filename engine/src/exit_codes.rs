//! Stable exit codes for `bench` commands.

/// Command succeeded; for `run`, the experiment completed or halted at an `until` target.
pub const OK: i32 = 0;
/// Unrecovered failure, or an experiment left `failed` or `interrupted`.
pub const FAILURE: i32 = 1;
