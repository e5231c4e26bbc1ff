//! Crate-wide error taxonomy.
//!
//! The five variants line up with the error kinds distinguished by the
//! engine: resource exhaustion never unwinds anything, transient I/O is
//! absorbed by callers, fatal I/O kills exactly the one thread that hit it,
//! protocol errors are surfaced to stack callbacks, and configuration errors
//! abort start-up.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// A pool or bounded queue was full, or an allocation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// `EAGAIN`/`EWOULDBLOCK`/`EINTR` on a path that retries.
    #[error("transient I/O error: {0}")]
    TransientIo(#[source] io::Error),

    /// Any other errno on the TUN read path; the owning reader aborts.
    #[error("fatal I/O error: {0}")]
    FatalIo(#[source] io::Error),

    /// An error surfaced from the embedded stack to a callback.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Missing or invalid configuration at init.
    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// Classify an [`io::Error`] from the TUN read path per spec.md §4.6: only
    /// `EAGAIN`/`EWOULDBLOCK`/`EINTR` are transient, everything else is fatal.
    pub fn from_tun_read(err: io::Error) -> Self {
        let transient = matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted);
        if transient {
            TunnelError::TransientIo(err)
        } else {
            TunnelError::FatalIo(err)
        }
    }
}
