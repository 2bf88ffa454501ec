//! Error types for each layer of the server.

use std::io;

use thiserror::Error;

/// Status returns of the hash table's structural operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DictError {
    #[error("key already exists")]
    Exists,

    #[error("key not found")]
    NotFound,

    /// Expansion or shrinking refused while a rehash is in progress or
    /// resizing is disabled.
    #[error("table is rehashing or resizing is disabled")]
    Resizing,

    #[error("requested size {requested} cannot hold {used} elements")]
    TooSmall { requested: usize, used: usize },
}

/// Reactor failures. Registration errors go back to the caller, poll
/// errors are fatal to the loop.
#[derive(Debug, Error)]
pub enum AeError {
    #[error("fd {fd} is outside the event loop set size {setsize}")]
    FdOutOfRange { fd: i32, setsize: usize },

    #[error("cannot shrink set size to {requested}: fd {max_fd} is registered")]
    SetSizeTooSmall { requested: usize, max_fd: i32 },

    #[error("poll failed: {0}")]
    Poll(#[from] nix::errno::Errno),
}

/// Malformed client input. The Display text is the error reply sent to
/// the client before the connection is closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Protocol error: too big inline request")]
    InlineTooBig,

    #[error("Protocol error: unbalanced quotes in request")]
    UnbalancedQuotes,

    #[error("Protocol error: too big mbulk count string")]
    BigMultibulkCount,

    #[error("Protocol error: invalid multibulk length")]
    InvalidMultibulkLength,

    #[error("Protocol error: too big bulk count string")]
    BigBulkCount,

    #[error("Protocol error: expected '$', got '{0}'")]
    ExpectedDollar(char),

    #[error("Protocol error: invalid bulk length")]
    InvalidBulkLength,
}

/// Startup and serving failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event loop error: {0}")]
    Ae(#[from] AeError),

    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

pub type ServerResult<T> = Result<T, ServerError>;
