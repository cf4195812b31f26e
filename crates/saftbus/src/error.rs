//! Bus error taxonomy.
//!
//! `Error` is what the library surfaces to Rust callers; `ErrorKind` is the
//! wire-level discriminator carried in error envelopes. The two map onto each
//! other losslessly (modulo the `std::io::Error` payload, which travels as its
//! display string).

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No object is registered under the requested id or path.
    #[error("unknown object: {0}")]
    UnknownObject(String),

    /// Interface or function index outside the service's declared surface.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Arguments did not decode to what the function expects.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Transport-level failure. Terminates the affected connection's proxies,
    /// never the whole process.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic service-reported fault, including contained panics.
    #[error("{0}")]
    Failed(String),
}

impl Error {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::InvalidArgs(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownObject(_) => ErrorKind::UnknownObject,
            Self::UnknownMethod(_) => ErrorKind::UnknownMethod,
            Self::InvalidArgs(_) => ErrorKind::InvalidArgs,
            Self::Io(_) => ErrorKind::IoError,
            Self::Failed(_) => ErrorKind::Failed,
        }
    }

    /// The message payload placed in an error envelope (the bare detail
    /// string, not the `Display` rendering, so `from_wire` does not stack
    /// prefixes).
    pub fn wire_message(&self) -> String {
        match self {
            Self::UnknownObject(m)
            | Self::UnknownMethod(m)
            | Self::InvalidArgs(m)
            | Self::Failed(m) => m.clone(),
            Self::Io(e) => e.to_string(),
        }
    }

    /// Rebuild an `Error` from the pieces of an error envelope.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::UnknownObject => Self::UnknownObject(message),
            ErrorKind::UnknownMethod => Self::UnknownMethod(message),
            ErrorKind::InvalidArgs => Self::InvalidArgs(message),
            ErrorKind::IoError => Self::Io(std::io::Error::other(message)),
            ErrorKind::Failed => Self::Failed(message),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}

/// Wire-level error discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownObject,
    UnknownMethod,
    InvalidArgs,
    IoError,
    Failed,
}
