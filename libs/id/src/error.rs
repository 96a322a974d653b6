use thiserror::Error;

/// Why a string is not a valid identifier of the requested kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    /// Well-formed, but names a different kind of resource (a node ID passed
    /// where an instance ID was expected, say).
    #[error("expected a '{expected}_' identifier, got '{found}_'")]
    WrongKind {
        expected: &'static str,
        found: String,
    },

    #[error("'{0}' is not of the form <prefix>_<ulid>")]
    Malformed(String),

    #[error("bad ULID in '{input}': {reason}")]
    BadUlid { input: String, reason: String },
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// True when the input was a valid identifier of another kind.
    pub fn is_wrong_kind(&self) -> bool {
        matches!(self, IdError::WrongKind { .. })
    }
}
