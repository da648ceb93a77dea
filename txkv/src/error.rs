use serde_derive::{Deserialize, Serialize};

/// Crate-wide result type.
///
/// `Error` covers failures that abort the surrounding operation outright:
/// bad configuration, malformed wire data, transport breakdown. Expected
/// per-operation outcomes (a contended bucket, a displaced cache entry, an
/// owned directory entry) are not errors; they are status enums returned by
/// the cache and directory, and the transaction driver folds them into its
/// abort decision.
pub type CResult<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried by the caller.
    Abort,

    /// Invalid user input or configuration.
    InvalidInput(String),

    /// A value failed to parse or decode.
    Parse(String),

    /// An I/O failure.
    Io(String),

    /// An unexpected internal state.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Io(msg) => write!(f, "io error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
