//! The negotiation engine: session registry, public API and event stream.
//!
//! An [`Engine`] is constructed with its external collaborators (signaling
//! channel, socket connector, relay discovery) and owns the registries of
//! pluggable components. All outcomes the owner cares about arrive on the
//! [`EngineEvent`] receiver returned by [`Engine::new`]; the methods
//! themselves only report acceptance or refusal of the operation.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config;
use crate::content::{random_content_name, Content};
use crate::description::{Description, DescriptionAdapter, DescriptionRegistry, FileDescriptionAdapter};
use crate::error::{EngineError, TransferFailure};
use crate::security::{Security, SecurityAdapter, SecurityRegistry};
use crate::session::Session;
use crate::signaling::channel::{
    ByteStream, RelayDiscovery, SignalingChannel, SignalingError, SocketConnector,
};
use crate::signaling::message::{
    Action, ActionResponse, Creator, EndpointId, Envelope, Reason, Senders,
};
use crate::transport::inband::InBandTransportManager;
use crate::transport::socket::SocketTransportManager;
use crate::transport::{Direction, TransportManager, TransportRegistry};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What the engine reports to its owner.
pub enum EngineEvent {
    /// A peer proposed a new session; answer with `accept_session` or
    /// `terminate_session`.
    SessionOffer {
        session_id: String,
        peer: EndpointId,
    },
    /// A peer proposed a new content within an active session; answer with
    /// `accept_content` or `reject_content`.
    ContentOffer {
        session_id: String,
        content_name: String,
        description_kind: String,
    },
    /// A content was removed or its proposal rejected by the peer.
    ContentRemoved {
        session_id: String,
        content_name: String,
    },
    /// A content's byte-stream is established and protected; the owner
    /// reads/writes the payload.
    StreamReady {
        session_id: String,
        content_name: String,
        direction: Direction,
        stream: ByteStream,
    },
    /// Payload bytes moved over a content's stream. Reported by the
    /// description layer driving the transfer.
    TransferProgress {
        session_id: String,
        content_name: String,
        bytes_transferred: u64,
    },
    /// A content's transfer finished completely; the session was
    /// terminated with `success` while the transfer was underway.
    TransferCompleted {
        session_id: String,
        content_name: String,
    },
    /// A content's transfer failed for good.
    TransferFailed {
        session_id: String,
        content_name: String,
        failure: TransferFailure,
    },
    /// The session is over, by either side.
    SessionEnded {
        session_id: String,
        reason: Reason,
    },
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::SessionOffer { session_id, peer } => f
                .debug_struct("SessionOffer")
                .field("session_id", session_id)
                .field("peer", peer)
                .finish(),
            EngineEvent::ContentOffer {
                session_id,
                content_name,
                description_kind,
            } => f
                .debug_struct("ContentOffer")
                .field("session_id", session_id)
                .field("content_name", content_name)
                .field("description_kind", description_kind)
                .finish(),
            EngineEvent::ContentRemoved {
                session_id,
                content_name,
            } => f
                .debug_struct("ContentRemoved")
                .field("session_id", session_id)
                .field("content_name", content_name)
                .finish(),
            EngineEvent::StreamReady {
                session_id,
                content_name,
                direction,
                ..
            } => f
                .debug_struct("StreamReady")
                .field("session_id", session_id)
                .field("content_name", content_name)
                .field("direction", direction)
                .finish_non_exhaustive(),
            EngineEvent::TransferProgress {
                session_id,
                content_name,
                bytes_transferred,
            } => f
                .debug_struct("TransferProgress")
                .field("session_id", session_id)
                .field("content_name", content_name)
                .field("bytes_transferred", bytes_transferred)
                .finish(),
            EngineEvent::TransferCompleted {
                session_id,
                content_name,
            } => f
                .debug_struct("TransferCompleted")
                .field("session_id", session_id)
                .field("content_name", content_name)
                .finish(),
            EngineEvent::TransferFailed {
                session_id,
                content_name,
                failure,
            } => f
                .debug_struct("TransferFailed")
                .field("session_id", session_id)
                .field("content_name", content_name)
                .field("failure", failure)
                .finish(),
            EngineEvent::SessionEnded { session_id, reason } => f
                .debug_struct("SessionEnded")
                .field("session_id", session_id)
                .field("reason", reason)
                .finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine Core
// ---------------------------------------------------------------------------

/// Shared internals handed (as `Arc<EngineCore>`) to sessions, contents and
/// transports.
pub struct EngineCore {
    /// The local endpoint's identity on the signaling channel.
    pub local: EndpointId,
    /// The signaling channel.
    pub channel: Arc<dyn SignalingChannel>,
    /// Outbound connections and inbound custody.
    pub connector: Arc<dyn SocketConnector>,
    /// Relay discovery and activation.
    pub relays: Arc<dyn RelayDiscovery>,
    /// Transport kinds this engine negotiates.
    pub transports: TransportRegistry,
    /// Description kinds this engine understands.
    pub descriptions: DescriptionRegistry,
    /// Security kinds this engine understands.
    pub securities: SecurityRegistry,
    sessions: DashMap<String, Arc<Session>>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineCore {
    /// Hands an event to the owner. A dropped receiver only means the owner
    /// stopped listening.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Sends a request, bounded by the protocol request timeout.
    pub async fn request(
        &self,
        to: &EndpointId,
        envelope: Envelope,
    ) -> Result<ActionResponse, SignalingError> {
        match tokio::time::timeout(config::REQUEST_TIMEOUT, self.channel.send_request(to, envelope))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SignalingError::Timeout),
        }
    }

    /// Sends a best-effort notification; delivery failures are logged only.
    pub async fn notify(&self, to: &EndpointId, envelope: Envelope) {
        if let Err(error) = self.channel.send_notify(to, envelope).await {
            warn!(peer = %to, %error, "notification delivery failed");
        }
    }

    /// Looks a session up by id.
    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drops a session from the registry.
    pub fn deregister(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Construction-time options of an [`Engine`].
pub struct EngineConfig {
    /// The local endpoint's identity on the signaling channel.
    pub local: EndpointId,
    /// Hosts the application accepts direct connections on, advertised as
    /// direct candidates.
    pub local_hosts: Vec<(String, u16)>,
    /// Whether to register the in-band fallback transport.
    pub inband_fallback: bool,
    /// Chunk size offered by the in-band transport.
    pub inband_block_size: usize,
}

impl EngineConfig {
    /// Defaults: no direct candidates, in-band fallback enabled.
    pub fn new(local: EndpointId) -> Self {
        Self {
            local,
            local_hosts: Vec::new(),
            inband_fallback: true,
            inband_block_size: config::INBAND_BLOCK_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// Content Specification
// ---------------------------------------------------------------------------

/// What a locally proposed content should carry.
pub struct ContentSpec {
    /// Content name; generated as `cont-<random>` when absent.
    pub name: Option<String>,
    /// Who sends on the established stream.
    pub senders: Senders,
    /// The application layer.
    pub description: Arc<dyn Description>,
    /// Optional protection layer.
    pub security: Option<Arc<dyn Security>>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The negotiation engine. Cheap to clone; all clones share one core.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Builds an engine around its collaborators and returns it together
    /// with the event stream.
    ///
    /// The socket transport, the in-band fallback (unless disabled) and the
    /// file description are registered out of the box.
    pub fn new(
        config: EngineConfig,
        channel: Arc<dyn SignalingChannel>,
        connector: Arc<dyn SocketConnector>,
        relays: Arc<dyn RelayDiscovery>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let core = Arc::new(EngineCore {
            local: config.local,
            channel,
            connector,
            relays: Arc::clone(&relays),
            transports: TransportRegistry::new(),
            descriptions: DescriptionRegistry::new(),
            securities: SecurityRegistry::new(),
            sessions: DashMap::new(),
            events,
        });

        core.transports.register(Arc::new(SocketTransportManager::new(
            relays,
            config.local_hosts,
        )));
        if config.inband_fallback {
            core.transports
                .register(Arc::new(InBandTransportManager::new(config.inband_block_size)));
        }
        core.descriptions.register(Arc::new(FileDescriptionAdapter));

        (Self { core }, receiver)
    }

    /// Registers an additional description kind.
    pub fn register_description(&self, adapter: Arc<dyn DescriptionAdapter>) {
        self.core.descriptions.register(adapter);
    }

    /// Registers a security kind.
    pub fn register_security(&self, adapter: Arc<dyn SecurityAdapter>) {
        self.core.securities.register(adapter);
    }

    /// Registers an additional transport kind.
    pub fn register_transport(&self, manager: Arc<dyn TransportManager>) {
        self.core.transports.register(manager);
    }

    /// The local endpoint's identity.
    pub fn local(&self) -> &EndpointId {
        &self.core.local
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>, EngineError> {
        self.core
            .session(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))
    }

    async fn build_content(&self, spec: ContentSpec, creator: Creator) -> Result<Arc<Content>, EngineError> {
        let manager = self
            .core
            .transports
            .best(&Default::default())
            .ok_or(EngineError::NoTransportAvailable)?;
        let transport = manager.create_for_initiator().await?;
        let name = spec.name.unwrap_or_else(random_content_name);
        Ok(Arc::new(Content::new(
            name,
            creator,
            spec.senders,
            spec.description,
            spec.security,
            transport,
        )))
    }

    // -- public operations ----------------------------------------------------

    /// Starts a new session towards `peer`, offering `specs`. Returns the
    /// session id once the peer acknowledged the initiate.
    pub async fn start_session(
        &self,
        peer: EndpointId,
        specs: Vec<ContentSpec>,
    ) -> Result<String, EngineError> {
        if specs.is_empty() {
            return Err(EngineError::InvalidState {
                current: "no contents to offer".to_string(),
                operation: "start_session",
            });
        }
        let mut contents = Vec::with_capacity(specs.len());
        for spec in specs {
            contents.push(self.build_content(spec, Creator::Initiator).await?);
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Session::new_initiated(
            session_id.clone(),
            self.core.local.clone(),
            peer,
            contents,
        );
        self.core.sessions.insert(session_id.clone(), Arc::clone(&session));
        if let Err(error) = session.initiate(&self.core).await {
            self.core.deregister(&session_id);
            return Err(error);
        }
        Ok(session_id)
    }

    /// Accepts a session offered by a peer.
    pub async fn accept_session(&self, session_id: &str) -> Result<(), EngineError> {
        self.session(session_id)?.accept(&self.core).await
    }

    /// Terminates a session with `reason` and informs the peer.
    pub async fn terminate_session(&self, session_id: &str, reason: Reason) -> Result<(), EngineError> {
        self.session(session_id)?.terminate(&self.core, reason).await
    }

    /// Proposes an additional content within an active session. Returns the
    /// content's name.
    pub async fn add_content(&self, session_id: &str, spec: ContentSpec) -> Result<String, EngineError> {
        let session = self.session(session_id)?;
        let content = self.build_content(spec, session.local_creator()).await?;
        let name = content.name().to_string();
        session.add_content(&self.core, content).await?;
        Ok(name)
    }

    /// Accepts a peer-proposed content and starts its transport.
    pub async fn accept_content(&self, session_id: &str, name: &str) -> Result<(), EngineError> {
        self.session(session_id)?.accept_content(&self.core, name).await
    }

    /// Rejects a peer-proposed content.
    pub async fn reject_content(&self, session_id: &str, name: &str) -> Result<(), EngineError> {
        self.session(session_id)?.reject_content(&self.core, name).await
    }

    /// Removes an agreed content and stops its transport.
    pub async fn remove_content(&self, session_id: &str, name: &str) -> Result<(), EngineError> {
        self.session(session_id)?.remove_content(&self.core, name).await
    }

    // -- incoming dispatch ----------------------------------------------------

    /// Feeds one incoming signaling message into the engine and returns the
    /// synchronous response the channel should deliver back to the sender.
    ///
    /// An `Err` means the message was a protocol violation; the channel
    /// should answer it as malformed. The offending session, if any, has
    /// already been torn down.
    pub async fn handle_incoming(&self, envelope: Envelope) -> Result<ActionResponse, EngineError> {
        if envelope.action == Action::SessionInitiate {
            return self.handle_session_initiate(envelope).await;
        }
        let session = match self.core.session(&envelope.session_id) {
            Some(session) => session,
            None => return Ok(ActionResponse::UnknownSession),
        };
        match session.handle(&self.core, &envelope).await {
            Ok(response) => Ok(response),
            Err(EngineError::ProtocolViolation(detail)) => {
                warn!(
                    session_id = %envelope.session_id,
                    %detail,
                    "protocol violation, tearing the session down"
                );
                let terminate = Envelope::session_terminate(&envelope.session_id, Reason::Cancel);
                self.core.notify(session.peer(), terminate).await;
                session.force_end();
                self.core.deregister(&envelope.session_id);
                self.core.emit(EngineEvent::SessionEnded {
                    session_id: envelope.session_id.clone(),
                    reason: Reason::Cancel,
                });
                Err(EngineError::ProtocolViolation(detail))
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_session_initiate(&self, envelope: Envelope) -> Result<ActionResponse, EngineError> {
        if self.core.session(&envelope.session_id).is_some() {
            return Ok(ActionResponse::OutOfOrder);
        }
        let peer = match &envelope.initiator {
            Some(initiator) => initiator.clone(),
            None => {
                return Err(EngineError::ProtocolViolation(
                    "session-initiate without initiator".to_string(),
                ))
            }
        };
        let session =
            match Session::from_initiate(&self.core, self.core.local.clone(), &envelope).await {
                Ok(session) => session,
                Err(error) => {
                    // Unsupported offers are declined, not treated as
                    // violations.
                    let reason = match &error {
                        EngineError::UnsupportedDescription(_) => Reason::UnsupportedApplications,
                        EngineError::UnsupportedTransport(_) => Reason::UnsupportedTransports,
                        EngineError::UnsupportedSecurity(_) => Reason::SecurityError,
                        _ => return Err(error),
                    };
                    info!(
                        session_id = %envelope.session_id,
                        %reason,
                        "declining session offer"
                    );
                    let terminate = Envelope::session_terminate(&envelope.session_id, reason);
                    self.core.notify(&peer, terminate).await;
                    return Ok(ActionResponse::Ack);
                }
            };
        self.core
            .sessions
            .insert(envelope.session_id.clone(), Arc::clone(&session));
        info!(session_id = %envelope.session_id, %peer, "session offered by peer");
        self.core.emit(EngineEvent::SessionOffer {
            session_id: envelope.session_id,
            peer,
        });
        Ok(ActionResponse::Ack)
    }
}
