//! Error types for the probe compiler

use std::fmt;
use thiserror::Error;

/// Source location of a node (1-based line and column, 0 when synthesized)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Loc {
    /// Line number
    pub line: u32,
    /// Column number
    pub col: u32,
}

impl Loc {
    /// Creates a location
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Compiler errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Type error
    ///
    /// **Triggered by:** incompatible operands, member access on a non-struct,
    /// dereference of a non-pointer, non-scalar array index
    /// **Example:** `m[k] = "str"` after `m[k] = 1`
    #[error("{loc}: type error: {message}")]
    TypeError {
        /// Error description, with operand types
        message: String,
        /// Location of the offending node
        loc: Loc,
    },

    /// Wrong expression shape for an operator
    ///
    /// **Triggered by:** `delete` on a non-subscript, `=` to a bare identifier
    #[error("{loc}: {message}")]
    StaticError {
        /// Error description
        message: String,
        /// Location of the offending node
        loc: Loc,
    },

    /// A platform limit was exceeded
    ///
    /// **Triggered by:** `mem(p, 10000)`, stack exhaustion, register pressure
    #[error("{loc}: {message}")]
    ResourceLimit {
        /// Error description, naming the limit
        message: String,
        /// Location of the offending node
        loc: Loc,
    },

    /// Inference reached a fixed point with this node still untyped
    #[error("{loc}: could not determine type of `{node}`")]
    UnresolvedType {
        /// Rendered node
        node: String,
        /// Location of the node
        loc: Loc,
    },

    /// Call to an operator that is not in the registry
    #[error("{loc}: unknown function `{name}`")]
    UnknownOperator {
        /// Operator name
        name: String,
        /// Location of the call
        loc: Loc,
    },

    /// Wrong number of arguments
    #[error("{loc}: `{op}` expects {expected} argument(s), got {got}")]
    Arity {
        /// Operator name
        op: String,
        /// Expected count (rendered, e.g. "1 or 2")
        expected: String,
        /// Actual count
        got: usize,
        /// Location of the call
        loc: Loc,
    },

    /// Construct the compiler does not support
    #[error("{loc}: not supported: {message}")]
    Unsupported {
        /// Error description
        message: String,
        /// Location of the offending node
        loc: Loc,
    },

    /// Internal consistency failure, indicates a compiler bug
    #[error("internal error: {0}")]
    Internal(String),

    /// Lowered program rejected by the verifier
    #[error("verification failed: {0}")]
    Verification(String),

    /// Compiler options could not be loaded
    #[error("invalid options: {0}")]
    Config(String),
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Compiler bug, not a user diagnostic
    Fatal,
    /// User-facing diagnostic; fixing the input fixes the compile
    Recoverable,
}

impl Error {
    /// Create a type error
    pub fn type_error(loc: Loc, msg: impl Into<String>) -> Self {
        Error::TypeError {
            message: msg.into(),
            loc,
        }
    }

    /// Create a structural validation error
    pub fn static_error(loc: Loc, msg: impl Into<String>) -> Self {
        Error::StaticError {
            message: msg.into(),
            loc,
        }
    }

    /// Create a resource-limit error
    pub fn resource(loc: Loc, msg: impl Into<String>) -> Self {
        Error::ResourceLimit {
            message: msg.into(),
            loc,
        }
    }

    /// Create an unsupported-construct error
    pub fn unsupported(loc: Loc, msg: impl Into<String>) -> Self {
        Error::Unsupported {
            message: msg.into(),
            loc,
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Create an options error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::Internal(_) | Error::Verification(_) => ErrorSeverity::Fatal,
            _ => ErrorSeverity::Recoverable,
        }
    }

    /// Location of the diagnostic, if it has one
    pub fn loc(&self) -> Option<Loc> {
        match self {
            Error::TypeError { loc, .. }
            | Error::StaticError { loc, .. }
            | Error::ResourceLimit { loc, .. }
            | Error::UnresolvedType { loc, .. }
            | Error::UnknownOperator { loc, .. }
            | Error::Arity { loc, .. }
            | Error::Unsupported { loc, .. } => Some(*loc),
            Error::Internal(_) | Error::Verification(_) | Error::Config(_) => None,
        }
    }
}

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            Error::internal("boom").classify(),
            ErrorSeverity::Fatal
        );
        assert_eq!(
            Error::type_error(Loc::new(1, 2), "bad").classify(),
            ErrorSeverity::Recoverable
        );
    }

    #[test]
    fn test_display_includes_location() {
        let err = Error::resource(Loc::new(3, 7), "too big");
        assert_eq!(err.to_string(), "3:7: too big");
        assert_eq!(err.loc(), Some(Loc::new(3, 7)));
    }
}
