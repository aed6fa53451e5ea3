//! The engine's error type.
//!
//! There is no exception mechanism here: every fallible operation returns a
//! `Result`, and errors are propagated with `?` same as in the rest of the
//! crate. At the edges (the session opener, a peer connection's run loop)
//! errors are caught, logged, and turned into the appropriate isolation
//! behavior (close one peer; abort the session) per spec §7.

use std::fmt;
use std::io;

/// The result type used pervasively throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error conditions the engine can report.
#[derive(Debug)]
pub enum Error {
    /// A post-handshake frame was truncated or carried an unrecognized
    /// combination of length and id. Closes the offending peer; the session
    /// survives (spec §7).
    Framing(String),
    /// A peer's handshake carried a different info-hash than ours. Closes
    /// the offending peer permanently; the session survives (spec §7).
    HandshakeMismatch,
    /// A peer's handshake did not have the expected `pstrlen == 19` /
    /// `"BitTorrent protocol"` prologue.
    InvalidHandshake,
    /// The configured info-hash string was not 40 lowercase-or-uppercase hex
    /// characters (spec §9 open question 5: decoding is made to fail loudly
    /// here rather than silently miscode).
    InvalidInfoHash,
    /// The `bt://<id>` session URI did not carry a self-id in `[10, 99]`.
    InvalidSessionUri(String),
    /// A piece index fell outside `[0, num_pieces)`.
    InvalidPieceIndex(usize),
    /// A socket-level failure (connect, accept, send, recv). Closes the
    /// affected peer; outbound attempts increment their retry count
    /// (spec §7).
    Socket(io::Error),
    /// The session's listening socket failed to bind. Aborts the session
    /// (spec §7).
    ListenerBindFailed(io::Error),
    /// An internal channel to a peer task or the session loop was closed
    /// while a message was still in flight to it.
    ChannelClosed,
    /// A peer sent a message that is well-formed on the wire but not valid
    /// at this point in the session (e.g. a second BITFIELD, or any message
    /// other than BITFIELD during availability exchange). Closes the
    /// offending peer; the session survives (spec §7).
    ProtocolViolation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Framing(reason) => write!(f, "malformed peer-wire frame: {}", reason),
            Error::HandshakeMismatch => {
                write!(f, "peer handshake carried a different info-hash")
            }
            Error::InvalidHandshake => write!(f, "peer handshake prologue is invalid"),
            Error::InvalidInfoHash => {
                write!(f, "info-hash must be 40 hex characters")
            }
            Error::InvalidSessionUri(uri) => {
                write!(f, "invalid session uri {:?}, expected bt://<10-99>", uri)
            }
            Error::InvalidPieceIndex(index) => {
                write!(f, "piece index {} is out of range", index)
            }
            Error::Socket(e) => write!(f, "socket error: {}", e),
            Error::ListenerBindFailed(e) => write!(f, "failed to bind listener: {}", e),
            Error::ChannelClosed => write!(f, "internal channel closed"),
            Error::ProtocolViolation(reason) => write!(f, "protocol violation: {}", reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Socket(e) => Some(e),
            Error::ListenerBindFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Socket(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_are_non_empty() {
        let errors = vec![
            Error::Framing("short read".to_string()),
            Error::HandshakeMismatch,
            Error::InvalidHandshake,
            Error::InvalidInfoHash,
            Error::InvalidSessionUri("ftp://1".to_string()),
            Error::InvalidPieceIndex(42),
            Error::ChannelClosed,
        ];
        for e in errors {
            assert!(!e.to_string().is_empty());
        }
    }
}
