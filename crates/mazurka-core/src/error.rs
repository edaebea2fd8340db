use std::io;

use thiserror::Error;

/// Central error type for the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The request was answered with an error response; the response bytes
    /// are already buffered on the connection.  The payload is the HTTP
    /// status that was sent.
    #[error("request aborted with status {0}")]
    Aborted(u16),

    /// A path walked through more than `MAX_LINKS` symlink substitutions.
    #[error("too many symlinks in {0}")]
    TooManyLinks(String),

    /// The CGI slot table is full.
    #[error("CGI tracker has no free slot")]
    CgiSlots,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
