//! # Runtime Errors
//!
//! Two families of failure:
//!
//! - [`RuntimeError`]: conditions the interpreter turns into a language
//!   exception (stack overflow, out of memory, resuming a continuation twice).
//! - [`InvariantViolation`]: corrupted runtime state. These are never
//!   returned to user code; [`fatal_error`] logs them and aborts.

use std::fmt;

use crate::log::{self, LogEntry, LogLevel, LogTarget, LogValue};
use crate::named::{self, NamedException};

/// A recoverable runtime failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A segment could not grow without exceeding the maximum stack size.
    StackOverflow {
        /// Free words that were requested.
        requested_words: usize,
        /// Domain maximum at the time of the request.
        max_words: usize,
    },
    /// Segment memory could not be obtained.
    OutOfMemory {
        /// Body size of the failed request.
        words: usize,
    },
    /// A continuation was used after it had already been consumed.
    ContinuationAlreadyResumed,
}

impl RuntimeError {
    /// The named exception the interpreter raises for this error.
    ///
    /// Exits the process if the exception was never registered.
    pub fn exception(&self) -> crate::value::Value {
        match self {
            RuntimeError::StackOverflow { .. } => named::STACK_OVERFLOW.resolve(),
            RuntimeError::OutOfMemory { .. } => named::OUT_OF_MEMORY.resolve(),
            RuntimeError::ContinuationAlreadyResumed => named::CONTINUATION_ALREADY_RESUMED.resolve(),
        }
    }

    /// The named exception this error maps to.
    pub fn named_exception(&self) -> &'static NamedException {
        match self {
            RuntimeError::StackOverflow { .. } => &named::STACK_OVERFLOW,
            RuntimeError::OutOfMemory { .. } => &named::OUT_OF_MEMORY,
            RuntimeError::ContinuationAlreadyResumed => &named::CONTINUATION_ALREADY_RESUMED,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::StackOverflow {
                requested_words,
                max_words,
            } => write!(
                f,
                "stack overflow: {} free words requested, limit is {} words",
                requested_words, max_words
            ),
            RuntimeError::OutOfMemory { words } => {
                write!(f, "out of memory allocating a {}-word stack", words)
            }
            RuntimeError::ContinuationAlreadyResumed => write!(f, "continuation already resumed"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Corrupted runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A local block points at a more recently allocated local block.
    BackwardsLocalPointer {
        /// Address of the referencing field.
        field: usize,
        /// Offset of the scan cursor.
        sp: isize,
        /// Offset of the referenced block.
        target: isize,
    },
    /// `replace` found the continuation already populated.
    ContinuationNotEmpty,
    /// A segment handed back to the allocator has a wrong magic number.
    BadSegmentMagic {
        /// Magic number found.
        found: u32,
    },
    /// No frame descriptor for a return address on the stack.
    MissingFrameDescriptor {
        /// The unknown return address.
        return_address: usize,
    },
    /// A frame walk left the segment it started in.
    FrameOutOfBounds {
        /// Offending stack pointer.
        sp: usize,
    },
    /// A live register slot with no register save area.
    MissingRegisterArea,
    /// A local arena walk found an impossible header or offset.
    CorruptLocalArena {
        /// Offset where the walk stopped.
        sp: isize,
    },
    /// Local arenas passed to a scan of interpreted stacks.
    LocalsInFlatMode,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::BackwardsLocalPointer { field, sp, target } => write!(
                f,
                "backwards local pointer at {:#x} (scan offset {}, target offset {})",
                field, sp, target
            ),
            InvariantViolation::ContinuationNotEmpty => write!(f, "replacing a continuation that is not empty"),
            InvariantViolation::BadSegmentMagic { found } => {
                write!(f, "freeing a segment with bad magic {}", found)
            }
            InvariantViolation::MissingFrameDescriptor { return_address } => {
                write!(f, "no frame descriptor for return address {:#x}", return_address)
            }
            InvariantViolation::FrameOutOfBounds { sp } => {
                write!(f, "frame walk left its segment at {:#x}", sp)
            }
            InvariantViolation::MissingRegisterArea => {
                write!(f, "live register slot without a register save area")
            }
            InvariantViolation::CorruptLocalArena { sp } => {
                write!(f, "corrupt local arena at offset {}", sp)
            }
            InvariantViolation::LocalsInFlatMode => write!(f, "local arenas outside native code"),
        }
    }
}

impl std::error::Error for InvariantViolation {}

/// Log a violation and abort the process.
pub fn fatal_error(violation: InvariantViolation) -> ! {
    let mut entry = LogEntry::new(LogLevel::Error, LogTarget::Fatal, format!("Fatal error: {}", violation));
    entry.fields.push(("kind".to_string(), LogValue::Str(format!("{:?}", violation))));
    log::emit_always(entry);
    std::process::abort()
}

/// Result alias for recoverable runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::StackOverflow {
            requested_words: 42,
            max_words: 1024,
        };
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("1024"));
        assert_eq!(
            RuntimeError::ContinuationAlreadyResumed.to_string(),
            "continuation already resumed"
        );
    }

    #[test]
    fn test_named_exception_mapping() {
        assert_eq!(
            RuntimeError::ContinuationAlreadyResumed.named_exception().name(),
            "Effect.Continuation_already_resumed"
        );
        assert_eq!(
            RuntimeError::StackOverflow {
                requested_words: 1,
                max_words: 1
            }
            .named_exception()
            .name(),
            "Stack_overflow"
        );
    }

    #[test]
    fn test_violation_display() {
        let v = InvariantViolation::BackwardsLocalPointer {
            field: 0x1000,
            sp: -16,
            target: -64,
        };
        let text = v.to_string();
        assert!(text.starts_with("backwards local pointer"));
        assert!(text.contains("-64"));
    }
}
