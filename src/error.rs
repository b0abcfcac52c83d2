//! Per-connection error taxonomy.
//!
//! Startup and configuration failures are reported through `anyhow` and stop
//! the process; everything here is contained to a single connection.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure on connect, bind, accept, send or receive.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// TLS negotiation or certificate verification failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// Orderly peer shutdown. Not a failure at session boundaries.
    #[error("peer closed the stream")]
    EndOfStream,

    /// Framing inconsistency: bad length, out-of-range element, truncated batch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Idle deadline passed inside an established session.
    #[error("{op} timed out after {ms} ms")]
    Timeout { op: &'static str, ms: u64 },

    #[error("signing task failed: {0}")]
    Signing(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }

    /// A connect that ran out of time is a transport failure like any other
    /// connect error.
    pub(crate) fn connect_timeout(ms: u64) -> Self {
        Error::Transport(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect timed out after {ms} ms"),
        ))
    }

    /// Likewise a stalled TLS negotiation is a handshake failure.
    pub(crate) fn handshake_timeout(ms: u64) -> Self {
        Error::Handshake(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("TLS handshake timed out after {ms} ms"),
        ))
    }

    /// Reinterpret an orderly close as a short read. Used where the peer is
    /// in the middle of a message and closing is not a valid session end.
    pub(crate) fn eof_as_truncation(self, what: &str) -> Self {
        match self {
            Error::EndOfStream => Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream closed in the middle of {what}"),
            )),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_setup_timeouts_keep_their_category() {
        match Error::connect_timeout(5_000) {
            Error::Transport(e) => assert_eq!(e.kind(), ErrorKind::TimedOut),
            other => panic!("expected transport error, got {other:?}"),
        }
        match Error::handshake_timeout(10_000) {
            Error::Handshake(e) => assert_eq!(e.kind(), ErrorKind::TimedOut),
            other => panic!("expected handshake error, got {other:?}"),
        }
    }

    #[test]
    fn test_eof_as_truncation_only_touches_end_of_stream() {
        match Error::EndOfStream.eof_as_truncation("a chunk") {
            Error::Transport(e) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("expected transport error, got {other:?}"),
        }
        assert!(matches!(Error::protocol("x").eof_as_truncation("a chunk"), Error::Protocol(_)));
    }
}
