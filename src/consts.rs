//! Interpreter parameters

use std::time::Duration;

/* METHOD EXECUTION CONTEXT */

/// Number of local variable slots per method invocation (`Local0`..`Local7`).
pub const LOCAL_COUNT: usize = 8;

/// Maximum number of argument slots per method invocation (`Arg0`..`Arg6`).
pub const ARG_COUNT: usize = 7;

/// Maximum depth of the heap-backed frame chain.
///
/// Method calls, `Load`, and `LoadTable` each push one frame. The limit only
/// bounds runaway firmware; host stack usage stays flat regardless of depth.
pub const MAX_FRAME_DEPTH: usize = 256;

/// Maximum number of reference hops followed when collapsing a reference
/// chain. Chains deeper than this abort the running method.
pub const MAX_REFERENCE_DEPTH: usize = 32;

/// Upper bound on a single `While` loop's wall-clock runtime before the
/// method is aborted with a timeout.
pub const DEFAULT_LOOP_TIMEOUT: Duration = Duration::from_secs(3);

/* AML LANGUAGE LIMITS */

/// AML mutexes and serialized methods carry a sync level in `0..=15`.
pub const MAX_SYNC_LEVEL: u8 = 15;

/// Table revision at and above which integers are 64 bits wide. Tables with
/// a lower revision mask integer arithmetic to 32 bits.
pub const INTEGER_WIDTH_REVISION: u8 = 2;

/// Value returned by the `Revision` opcode.
pub const INTERPRETER_REVISION: u64 = 2;

/// Bytes in a System Description Table header.
pub const TABLE_HEADER_LEN: usize = 36;

/* EVENTS */

/// Timeout value meaning "wait forever" for `Acquire` and `Wait`.
pub const WAIT_FOREVER: u16 = 0xffff;
