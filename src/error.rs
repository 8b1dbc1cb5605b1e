//! Runtime interpreter error implementation

use crate::object::ObjectType;

use std::time::Duration;
use thiserror::Error;

/// Client-facing error variants surfaced by the subsystem API.
#[derive(Debug, Error)]
pub enum AmlError {
    /// An allocation failed while servicing the request.
    #[error("out of memory")]
    OutOfMemory,
    /// The requested name or table does not exist.
    #[error("object not found: {0}")]
    NotFound(String),
    /// The opcode stream is malformed and execution could not continue.
    #[error("malformed AML bytecode: {0}")]
    BadBytecode(&'static str),
    /// An operand could not be coerced to the type an operator requires.
    #[error("type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        /// Type the operation required.
        expected: ObjectType,
        /// Type actually supplied.
        found: ObjectType,
    },
    /// The caller misused the API.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// An install would shadow an existing registration or node.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Removal was refused because the object still has holders.
    #[error("still in use: {0}")]
    StillInUse(&'static str),
    /// A `While` loop or a wait primitive exceeded its budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// AML dereferenced a name that was never defined.
    #[error("undefined reference to {0}")]
    UndefinedReference(String),
    /// AML supplied an operand an operator cannot accept.
    #[error("bad AML operand: {0}")]
    BadOperand(&'static str),
    /// A table-installation hook refused the table.
    #[error("table installation denied")]
    Denied,
    /// The subsystem is not (or no longer) in the required init state.
    #[error("subsystem not ready: {0}")]
    NotReady(&'static str),
    /// A hardware handshake did not complete in time.
    #[error("hardware timeout")]
    HardwareTimeout,
    /// AML executed a `Fatal` opcode; the host was notified.
    #[error("fatal firmware error: type {typ:#x} code {code:#x} arg {arg:#x}")]
    Fatal {
        /// Fatal type byte from the opcode.
        typ: u8,
        /// Fatal code dword from the opcode.
        code: u32,
        /// Fatal argument evaluated at runtime.
        arg: u64,
    },
    /// The namespace tree is corrupted; continuing is unsafe.
    #[error("namespace corruption detected")]
    Corruption,
}

impl AmlError {
    /// Flag whether this error leaves the subsystem unusable.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption)
    }
}

/// Reason a method evaluation unwound before producing a result.
///
/// Aborts propagate synchronously to the evaluate-entry API call and never
/// cross into independent evaluations. Side effects performed before the
/// abort persist.
#[derive(Debug, Error)]
pub enum MethodAbort {
    /// The abort carries a client-facing error as-is.
    #[error(transparent)]
    Error(#[from] AmlError),
    /// A reference chain exceeded the configured depth.
    #[error("reference chain deeper than {0} links")]
    ReferenceDepth(usize),
    /// The frame chain exceeded its depth bound.
    #[error("method call or Load nesting deeper than {0} frames")]
    FrameDepth(usize),
    /// A local or argument slot was read before it was written.
    #[error("use of uninitialized {0}")]
    Uninitialized(&'static str),
    /// `Release` on a mutex the current invocation does not own.
    #[error("mutex released but not owned")]
    MutexNotOwned,
    /// `Acquire` would invert the sync-level order.
    #[error("sync level {acquired} acquired while holding {held}")]
    SyncLevel {
        /// Level of the mutex being acquired.
        acquired: u8,
        /// Highest level currently held.
        held: u8,
    },
}

impl MethodAbort {
    /// Collapse the abort into the error reported to the API caller.
    pub fn into_client(self) -> AmlError {
        match self {
            Self::Error(e) => e,
            Self::ReferenceDepth(_) | Self::FrameDepth(_) => {
                AmlError::BadBytecode("runaway nesting")
            }
            Self::Uninitialized(what) => AmlError::UndefinedReference(what.into()),
            Self::MutexNotOwned => AmlError::BadOperand("mutex not owned"),
            Self::SyncLevel { .. } => AmlError::BadOperand("sync level order violated"),
        }
    }
}

impl From<MethodAbort> for AmlError {
    fn from(abort: MethodAbort) -> Self {
        abort.into_client()
    }
}

/// Convenience alias used across the interpreter internals.
pub type AbortResult<T> = Result<T, MethodAbort>;
