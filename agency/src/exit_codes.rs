//! Stable exit codes for agency CLI commands.

use crate::errors::ErrorCode;

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed (any domain or internal error not listed below).
pub const FAILED: i32 = 1;
/// A run id or prefix did not match any run.
pub const NOT_FOUND: i32 = 2;
/// A run id prefix matched more than one run.
pub const AMBIGUOUS: i32 = 3;
/// Another agency process holds the repo lock.
pub const LOCKED: i32 = 4;

/// Exit code for a failed command, by error code.
pub fn for_error(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::RunNotFound => NOT_FOUND,
        ErrorCode::RunIdAmbiguous => AMBIGUOUS,
        ErrorCode::LockHeld => LOCKED,
        _ => FAILED,
    }
}
