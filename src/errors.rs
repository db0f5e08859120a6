//! The error taxonomy for the connection-lifecycle engine.
//!
//! Every fallible operation in this crate reports one of these kinds rather
//! than a raw `io::Error`, so the connection state machine can apply a fixed
//! policy (respond-and-close, retry, cull, propagate) without re-deriving it
//! from an errno at every call site.

use crate::http::types::StatusCode;
use std::{error, fmt, io};

/// Semantic error kinds produced anywhere in the engine.
#[derive(Debug)]
pub enum NxError {
    /// Parse failure or oversize request line/headers.
    MalformedRequest,
    /// Request target would overflow the fixed path buffer once joined with the document root.
    TargetTooLong,
    /// `open`/`stat` failed with `ENOENT` or the path is not a regular file.
    NotFound,
    /// `open`/`stat` failed with `EACCES`.
    Forbidden,
    /// Method other than GET/HEAD.
    NotImplemented,
    /// `EAGAIN`/`EWOULDBLOCK`/`EINTR`: treat as would-block, retry on next readiness.
    WouldBlock,
    /// Peer went away (`EPIPE`, `ECONNRESET`, or a read returning 0).
    PeerDisconnect,
    /// `EMFILE`/`ENFILE`: cull idle connections, back off, continue accepting.
    ResourceExhausted,
    /// Unexpected errno or allocation failure; log, respond 500 if possible, close.
    Internal(IoError),
    /// Listener error or fork failure; propagates to the worker/master exit path.
    Fatal(IoError),
}

impl NxError {
    /// The status this error produces on the wire, if any.
    ///
    /// `None` means the connection is destroyed without a response (peer
    /// disconnect, would-block, resource exhaustion, or a fatal error that
    /// never reaches a live socket).
    pub(crate) const fn as_status(&self) -> Option<StatusCode> {
        match self {
            NxError::MalformedRequest => Some(StatusCode::BAD_REQUEST),
            NxError::TargetTooLong => Some(StatusCode::URI_TOO_LONG),
            NxError::NotFound => Some(StatusCode::NOT_FOUND),
            NxError::Forbidden => Some(StatusCode::FORBIDDEN),
            NxError::NotImplemented => Some(StatusCode::NOT_IMPLEMENTED),
            NxError::Internal(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            NxError::WouldBlock
            | NxError::PeerDisconnect
            | NxError::ResourceExhausted
            | NxError::Fatal(_) => None,
        }
    }

    /// Whether the connection stays keep-alive after this error is handled:
    /// not-found/forbidden preserve keep-alive, everything else that reaches
    /// a client closes.
    pub(crate) const fn keeps_connection_alive(&self) -> bool {
        matches!(self, NxError::NotFound | NxError::Forbidden)
    }
}

impl error::Error for NxError {}
impl fmt::Display for NxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NxError::MalformedRequest => write!(f, "malformed request"),
            NxError::TargetTooLong => write!(f, "request target too long"),
            NxError::NotFound => write!(f, "not found"),
            NxError::Forbidden => write!(f, "forbidden"),
            NxError::NotImplemented => write!(f, "method not implemented"),
            NxError::WouldBlock => write!(f, "would block"),
            NxError::PeerDisconnect => write!(f, "peer disconnected"),
            NxError::ResourceExhausted => write!(f, "resource exhausted"),
            NxError::Internal(e) => write!(f, "internal error: {}", e.0),
            NxError::Fatal(e) => write!(f, "fatal error: {}", e.0),
        }
    }
}

impl From<io::Error> for NxError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NxError::WouldBlock,
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => NxError::PeerDisconnect,
            io::ErrorKind::NotFound => NxError::NotFound,
            io::ErrorKind::PermissionDenied => NxError::Forbidden,
            _ => match err.raw_os_error() {
                Some(libc::EMFILE) | Some(libc::ENFILE) => NxError::ResourceExhausted,
                _ => NxError::Internal(IoError(err)),
            },
        }
    }
}

/// Wraps [`io::Error`] with a `PartialEq` impl by comparing `.kind()`, the
/// same technique the request-validation error type used for this purpose.
#[derive(Debug)]
pub struct IoError(pub io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_has_no_status() {
        assert_eq!(NxError::WouldBlock.as_status(), None);
        assert_eq!(NxError::PeerDisconnect.as_status(), None);
    }

    #[test]
    fn not_found_keeps_connection_alive() {
        assert!(NxError::NotFound.keeps_connection_alive());
        assert!(!NxError::MalformedRequest.keeps_connection_alive());
    }

    #[test]
    fn io_error_maps_would_block() {
        let err: NxError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(err, NxError::WouldBlock));
    }

    #[test]
    fn not_found_maps_to_404_status() {
        assert_eq!(NxError::NotFound.as_status(), Some(StatusCode::NOT_FOUND));
    }

    #[test]
    fn internal_error_maps_to_500_and_closes() {
        let err: NxError = io::Error::other("boom").into();
        assert_eq!(err.as_status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!err.keeps_connection_alive());
    }
}
