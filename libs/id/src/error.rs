//! ID parse errors.

use thiserror::Error;

/// Why a string was refused as an ID. `kind` is the expected prefix.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty {kind} id")]
    Empty { kind: &'static str },

    /// No `{kind}_` prefix, or a different one.
    #[error("'{input}' is not a {kind} id (expected {kind}_<ulid>)")]
    WrongKind { kind: &'static str, input: String },

    #[error("'{input}' has a malformed ULID: {reason}")]
    BadUlid { input: String, reason: String },
}
