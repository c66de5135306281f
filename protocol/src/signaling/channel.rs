//! External capabilities consumed by the engine.
//!
//! The engine does not own a socket listener, a relay discovery mechanism or
//! a signaling connection; it is handed implementations of the traits below
//! at construction time. Tests wire in-memory implementations, deployments
//! wire the real ones.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::signaling::message::{ActionResponse, Envelope, EndpointId};

// ---------------------------------------------------------------------------
// Byte Streams
// ---------------------------------------------------------------------------

/// Object-safe async byte-stream bound. Anything readable and writable can
/// carry a content's payload, whether a TCP socket, a relayed connection or
/// an in-memory pipe.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A fully established, ready-to-use byte-stream.
pub type ByteStream = Box<dyn AsyncStream>;

// ---------------------------------------------------------------------------
// Signaling Errors
// ---------------------------------------------------------------------------

/// Delivery-level failure of the signaling channel.
///
/// Distinct from an [`ActionResponse`] rejection: a rejection means the peer
/// received and refused the request, a `SignalingError` means we cannot know
/// whether it arrived.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// No response arrived within the request timeout.
    #[error("signaling request timed out")]
    Timeout,

    /// The channel failed to carry the message.
    #[error("signaling delivery failed: {0}")]
    Delivery(String),
}

// ---------------------------------------------------------------------------
// Signaling Channel
// ---------------------------------------------------------------------------

/// Reliable, authenticated, ordered messaging between endpoints.
///
/// Implementations must guarantee exactly one [`ActionResponse`] per
/// successful `send_request`, and in-order delivery per peer. The in-band
/// fallback transport leans on both guarantees for its reliability.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Sends an envelope and waits for the peer's synchronous response.
    async fn send_request(
        &self,
        to: &EndpointId,
        envelope: Envelope,
    ) -> Result<ActionResponse, SignalingError>;

    /// Sends an envelope without waiting for any response.
    async fn send_notify(&self, to: &EndpointId, envelope: Envelope) -> Result<(), SignalingError>;
}

// ---------------------------------------------------------------------------
// Relay Discovery
// ---------------------------------------------------------------------------

/// A relay host willing to forward bytes between two endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHost {
    /// Host address of the relay's forwarding socket.
    pub host: String,
    /// Port of the relay's forwarding socket.
    pub port: u16,
    /// Signaling identity of the relay operator, used to address the
    /// activation request.
    pub identity: EndpointId,
}

/// Discovery and activation of relay hosts.
#[async_trait]
pub trait RelayDiscovery: Send + Sync {
    /// Lists usable relay hosts, best first.
    async fn list_relay_hosts(&self) -> Result<Vec<RelayHost>, SignalingError>;

    /// Asks `relay` to start forwarding the stream identified by
    /// `stream_id` towards `peer`.
    async fn activate(
        &self,
        relay: &EndpointId,
        stream_id: &str,
        peer: &EndpointId,
    ) -> Result<(), SignalingError>;
}

// ---------------------------------------------------------------------------
// Socket Connector
// ---------------------------------------------------------------------------

/// Outbound connections and custody of inbound ones.
///
/// The engine never binds listeners itself. The surrounding application
/// advertises the hosts it listens on and, when a peer connects in, hands
/// the accepted connection over through [`claim_inbound`].
///
/// [`claim_inbound`]: SocketConnector::claim_inbound
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Opens an outbound connection, bounded by `timeout`.
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<ByteStream>;

    /// Takes over the inbound connection a peer opened against one of our
    /// advertised candidates, matched by the transport's stream id. Waits up
    /// to `timeout` for the connection to arrive.
    async fn claim_inbound(&self, stream_id: &str, timeout: Duration) -> io::Result<ByteStream>;
}

/// Plain TCP connector for deployments where the application handles
/// inbound connections elsewhere (or advertises no direct candidates).
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl SocketConnector for TcpConnector {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<ByteStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        Ok(Box::new(stream))
    }

    async fn claim_inbound(&self, _stream_id: &str, _timeout: Duration) -> io::Result<ByteStream> {
        // Inbound custody needs the application's listener. Advertise no
        // direct candidates when using this connector, or wrap it.
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TcpConnector does not track inbound connections",
        ))
    }
}
