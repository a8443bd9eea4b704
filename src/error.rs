//! # Error Taxonomy
//!
//! A single enum used across the crate for every failure that is not
//! transient backpressure. `EAGAIN` from the fabric is never wrapped in
//! this type: it is absorbed locally by the pending-request queue (see
//! [`crate::pending`]) and never surfaces to a caller.
//!
//! The variants mirror the error kinds named in the specification's error
//! handling section: invalid argument, resource exhaustion, peer
//! reachability, and fatal protocol violation. A fifth variant wraps
//! fabric-provider errors that have not yet been classified into one of
//! those buckets; [`TransportError::from_fabric`] performs that
//! classification using the same errno-range mapping a production NCCL
//! plugin uses to translate provider errors into its own error enum.

use thiserror::Error;

/// Errors surfaced by the transport core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Bad communicator id, wrong request kind found in a slot, an
    /// oversized scatter-array receive, a null/invalid handle, or an
    /// unrecognized configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A freelist, id pool, or inflight-request budget is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The peer connection was aborted, reset, refused, or the host is
    /// unreachable/down. Maps from the fabric provider's connection-class
    /// errors.
    #[error("remote error: {0}")]
    Remote(String),

    /// A bounce-buffer receive failed, an unrecognized completion-flag
    /// combination was observed, or a schedule produced an unexpected
    /// number of transfers for a control message. The owning endpoint may
    /// no longer be usable after this error.
    #[error("fatal protocol violation: {0}")]
    Protocol(String),

    /// Any other fabric-provider failure that is not itself `EAGAIN` and
    /// does not fall into one of the categories above.
    #[error("system error: {0}")]
    System(String),
}

/// The fabric error codes that the shim maps to [`TransportError::Remote`],
/// named after the POSIX errno values they overlap with (spec.md §9,
/// "Error mapping"). `INVAL` maps to `InvalidArgument` rather than
/// `System`, and everything else not listed falls through to `System`.
pub fn classify_fabric_errno(errno: i32) -> TransportError {
    // Magnitude only; fabric providers return negative errno-like codes.
    match errno.abs() {
        libc::ECONNABORTED => TransportError::Remote("connection aborted".into()),
        libc::ECONNRESET => TransportError::Remote("connection reset".into()),
        libc::ECONNREFUSED => TransportError::Remote("connection refused".into()),
        libc::ENOTCONN => TransportError::Remote("not connected".into()),
        libc::EHOSTDOWN => TransportError::Remote("host down".into()),
        libc::EHOSTUNREACH => TransportError::Remote("host unreachable".into()),
        libc::EINVAL => TransportError::InvalidArgument("fabric provider rejected argument".into()),
        other => TransportError::System(format!("fabric error (errno {other})")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_errors_as_remote() {
        assert!(matches!(
            classify_fabric_errno(-libc::ECONNRESET),
            TransportError::Remote(_)
        ));
        assert!(matches!(
            classify_fabric_errno(-libc::EHOSTUNREACH),
            TransportError::Remote(_)
        ));
    }

    #[test]
    fn classifies_inval_as_invalid_argument() {
        assert!(matches!(
            classify_fabric_errno(-libc::EINVAL),
            TransportError::InvalidArgument(_)
        ));
    }

    #[test]
    fn classifies_unknown_as_system() {
        assert!(matches!(
            classify_fabric_errno(-libc::ENOMEM),
            TransportError::System(_)
        ));
    }
}
