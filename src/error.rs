//! The runtime's caller-visible error type.
//!
//! `UnsupportedArgSize` and `TooManyArgs` are the only failure modes returned
//! to callers. Every other structural failure (allocation, sigaction/
//! sigaltstack install, an invariant violation observed mid-schedule) is
//! logged at `error` level and the process aborts immediately -- there is no
//! `Result` for them because there is no recovery to express.

use std::fmt;

/// Error returned by [`crate::Runtime::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// An argument field's width was not one of `{1, 2, 4, 8}` bytes.
    UnsupportedArgSize {
        /// Zero-based position of the offending argument.
        index: usize,
        /// The width, in bytes, that was rejected.
        size: usize,
    },
    /// A coroutine was given more than [`crate::MAX_ARGS`] argument fields.
    TooManyArgs {
        /// The limit that was exceeded.
        max: usize,
    },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::UnsupportedArgSize { index, size } => write!(
                f,
                "argument {index} has unsupported size {size} bytes (must be 1, 2, 4, or 8)"
            ),
            RuntimeError::TooManyArgs { max } => {
                write!(f, "a coroutine may take at most {max} argument fields")
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_index_and_size() {
        let err = RuntimeError::UnsupportedArgSize { index: 2, size: 3 };
        assert_eq!(
            err.to_string(),
            "argument 2 has unsupported size 3 bytes (must be 1, 2, 4, or 8)"
        );
    }

    #[test]
    fn display_names_the_limit_on_too_many_args() {
        let err = RuntimeError::TooManyArgs { max: 8 };
        assert_eq!(
            err.to_string(),
            "a coroutine may take at most 8 argument fields"
        );
    }
}
