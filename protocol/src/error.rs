//! Error taxonomy of the negotiation engine.

use thiserror::Error;

use crate::signaling::channel::SignalingError;
use crate::signaling::message::Reason;

/// Why a content's transfer did not complete.
///
/// Carried by the transfer-failed engine event so the owner can distinguish
/// exhaustion from peer action from security trouble.
#[derive(Debug, Error)]
pub enum TransferFailure {
    /// Every registered transport kind has been tried and blacklisted.
    #[error("no transport kinds left to try")]
    NoTransportAvailable,

    /// The security layer could not protect the established stream.
    #[error("security layer failed: {0}")]
    Security(String),

    /// The peer terminated the session while the transfer was in flight.
    #[error("peer terminated the session: {0}")]
    PeerTerminated(Reason),
}

/// Error returned by engine operations and internal negotiation steps.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The operation does not apply to the session or content's current
    /// state (e.g. accepting an already active session).
    #[error("invalid state for {operation}: {current}")]
    InvalidState {
        /// Human-readable current state.
        current: String,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// The peer sent something the protocol forbids. The session is torn
    /// down when this surfaces from incoming dispatch.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No session registered under this id.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// No description adapter registered for this kind.
    #[error("unsupported description kind: {0}")]
    UnsupportedDescription(String),

    /// No transport manager registered for this kind.
    #[error("unsupported transport kind: {0}")]
    UnsupportedTransport(String),

    /// No security adapter registered for this kind.
    #[error("unsupported security kind: {0}")]
    UnsupportedSecurity(String),

    /// The signaling channel failed to deliver a request.
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    /// No registered transport kind remains usable for the content.
    #[error("no transport available")]
    NoTransportAvailable,

    /// The security layer rejected or failed to wrap a stream.
    #[error("security failed: {0}")]
    SecurityFailed(String),
}
