//! Stable exit codes for mk-agent commands.

/// Command succeeded, or the agent shut down on request.
pub const OK: i32 = 0;
/// Invalid configuration or arguments, or any other failure.
pub const INVALID: i32 = 1;
