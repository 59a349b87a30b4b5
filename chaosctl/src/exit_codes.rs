//! Stable exit codes for chaosctl CLI commands.

/// Command succeeded; any experiment it touched settled outside a failure status.
pub const OK: i32 = 0;
/// Bad input, configuration, missing experiment, or store/backend error.
pub const INVALID: i32 = 1;
/// The experiment settled in a failure status (validation, creation, or run),
/// or `check` found it unsatisfiable.
pub const FAILED: i32 = 2;
/// The requested transition is not allowed from the persisted status, or a
/// concurrent writer changed it first.
pub const CONFLICT: i32 = 3;
