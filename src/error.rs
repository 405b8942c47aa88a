//! Error types for the chat PEG parser.
//!
//! Most verdicts in this crate are *not* errors: a grammar that doesn't match
//! returns [`crate::peg::ParseResult::Fail`] and a grammar waiting on more
//! streamed bytes returns [`crate::peg::ParseResult::NeedMoreInput`], both as
//! plain values. [`Error`] is reserved for the handful of conditions that are
//! signaled rather than returned: malformed grammars/patterns at build time,
//! unhealable JSON truncations, mapper invariant violations, and the
//! subprocess collaborator's own I/O boundary.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A grammar referenced an undefined rule, or another build-time
    /// detectable defect (e.g. a directly self-referential rule).
    #[error("invalid grammar: {0}")]
    InvalidGrammar(String),

    /// A regex pattern used a feature outside the supported subset, or a
    /// malformed quantifier range.
    #[error("invalid regex pattern: {0}")]
    InvalidPattern(String),

    /// [`crate::json_partial::Partial::heal`] was asked to heal a truncation
    /// that landed inside an identifier (`tru`, `fal`, `nul`).
    #[error("cannot heal truncated JSON: {0}")]
    Unhealable(String),

    /// A mapper reached an AST tag it doesn't know how to handle. Indicates
    /// a grammar/mapper mismatch, never a malformed input.
    #[error("internal error: {0}")]
    InternalError(String),

    /// A mapper reached a state it should be structurally unable to reach
    /// (e.g. `TOOL_ARG_NAME` with no tool call open). Indicates a bug.
    #[error("bad mapper state: {0}")]
    BadState(String),

    /// JSON (de)serialization error, surfaced by the partial-JSON healer and
    /// the JSON-RPC subprocess collaborator.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error from the JSON-RPC subprocess collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new invalid-grammar error.
    pub fn invalid_grammar(msg: impl Into<String>) -> Self {
        Error::InvalidGrammar(msg.into())
    }

    /// Create a new invalid-pattern error.
    pub fn invalid_pattern(msg: impl Into<String>) -> Self {
        Error::InvalidPattern(msg.into())
    }

    /// Create a new unhealable error.
    pub fn unhealable(msg: impl Into<String>) -> Self {
        Error::Unhealable(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::InternalError(msg.into())
    }

    /// Create a new bad-state error.
    pub fn bad_state(msg: impl Into<String>) -> Self {
        Error::BadState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_invalid_grammar() {
        let err = Error::invalid_grammar("undefined rule 'foo'");
        assert!(matches!(err, Error::InvalidGrammar(_)));
        assert_eq!(err.to_string(), "invalid grammar: undefined rule 'foo'");
    }

    #[test]
    fn test_error_invalid_pattern() {
        let err = Error::invalid_pattern("unmatched '('");
        assert!(matches!(err, Error::InvalidPattern(_)));
        assert_eq!(err.to_string(), "invalid regex pattern: unmatched '('");
    }

    #[test]
    fn test_error_unhealable() {
        let err = Error::unhealable("truncated inside identifier");
        assert!(matches!(err, Error::Unhealable(_)));
    }

    #[test]
    fn test_error_internal_and_bad_state() {
        let err = Error::internal("unexpected tag");
        assert!(matches!(err, Error::InternalError(_)));
        let err = Error::bad_state("no current tool");
        assert!(matches!(err, Error::BadState(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }

        fn _returns_error() -> Result<i32> {
            Err(Error::bad_state("test"))
        }
    }
}
