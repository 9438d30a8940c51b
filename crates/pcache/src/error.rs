//! Error types for pcache

use thiserror::Error;

use crate::Pgno;

/// Result type alias for page cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for page cache operations
#[derive(Error, Debug)]
pub enum Error {
    /// Both the slab pool and the heap are exhausted
    #[error("out of memory: {requested} bytes")]
    NoMem {
        /// Size of the failed request
        requested: usize,
    },

    /// The handle refers to an entry that has been evicted or discarded
    #[error("stale page handle (slot {index})")]
    StaleHandle {
        /// Arena slot the handle pointed at
        index: u32,
    },

    /// The caller broke the calling contract
    #[error("library misuse: {0}")]
    Misuse(&'static str),

    /// A collaborator could not make progress right now
    #[error("busy")]
    Busy,

    /// The stress callback failed while spilling a dirty page
    #[error("failed to spill page {page}: {source}")]
    Spill {
        /// Page the callback was asked to make clean
        page: Pgno,
        /// Failure reported by the callback
        source: Box<Error>,
    },

    /// Configuration values are out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured status codes, numbered like SQLite's result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Resource busy.
    Busy = 5,
    /// Out of memory.
    NoMem = 7,
    /// Library used incorrectly.
    Misuse = 21,
}

impl Error {
    /// Map this error to its status code.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Error::NoMem { .. } => ErrorCode::NoMem,
            Error::StaleHandle { .. } | Error::Misuse(_) => ErrorCode::Misuse,
            Error::Busy => ErrorCode::Busy,
            Error::Spill { source, .. } => source.code(),
            Error::InvalidConfig(_) => ErrorCode::Error,
        }
    }

    /// True for allocation failures, including a spill that failed for lack of memory.
    pub fn is_nomem(&self) -> bool {
        matches!(self.code(), ErrorCode::NoMem)
    }
}
