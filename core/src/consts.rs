//! Default runtime constants. All of these can be overridden per-run via
//! [crate::RunConfig].

/// The maximum number of cycles (instructions executed) that a program can
/// run for before being killed. Programs that take exactly this many cycles
/// WILL terminate normally; going over causes a `TooManyCycles` error.
pub const MAX_CYCLE_COUNT: usize = 1000;

/// Initial size of the VM's linear memory, in slots. Grown on demand by
/// `alc` as frames are entered.
pub const MEMORY_SIZE: usize = 64;

/// Number of display register slots, i.e. the maximum lexical nesting depth
/// (global scope + nested procedures) a program can use.
pub const DISPLAY_SIZE: usize = 8;

/// Maximum number of characters a `chars[n]` string mode may hold, absent an
/// explicit declared bound. Not currently enforced as a hard ceiling; kept
/// as documentation of the assumed working set.
pub const MAX_STRING_LENGTH: usize = 256;
