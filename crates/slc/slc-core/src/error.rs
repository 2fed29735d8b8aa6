//! Classified error type returned from every fallible operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("incompatible file: {reason}")]
    Incompatible { reason: String },

    #[error("corrupt: {reason}")]
    Corrupt { reason: &'static str },

    #[error("busy")]
    Busy,

    #[error("cache invalidated")]
    Invalidated,

    #[error("handle closed")]
    Closed,

    #[error("writeback failed")]
    Writeback(#[source] std::io::Error),

    #[error("range operation requires ordered keys")]
    Unordered,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidInput {
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible(reason: impl Into<String>) -> Self {
        Error::Incompatible {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
