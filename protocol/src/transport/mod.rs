//! Transport negotiation: the component traits, the kind registry and the
//! context handed to running negotiators.
//!
//! A [`TransportManager`] knows how to mint negotiators of one kind; a
//! [`Transport`] is one live negotiator bound to a content, responsible for
//! producing a single established byte-stream (or reporting failure exactly
//! once). The [`TransportRegistry`] ranks the registered kinds so transport
//! selection and fallback are deterministic.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::signaling::channel::SignalingError;
use crate::signaling::message::{
    ActionResponse, Envelope, EndpointId, TransportElement, TransportInfoElement,
};

pub mod candidate;
pub mod inband;
pub mod socket;

// ---------------------------------------------------------------------------
// Transport Kind
// ---------------------------------------------------------------------------

/// Identifier of a transport method, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportKind(String);

impl TransportKind {
    /// Wraps an arbitrary kind identifier.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// The candidate-racing socket transport.
    pub fn socket() -> Self {
        Self("socket".to_string())
    }

    /// The reliable fallback tunneling bytes through the signaling channel.
    pub fn in_band() -> Self {
        Self("in-band".to_string())
    }

    /// The raw kind identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Stream Direction
// ---------------------------------------------------------------------------

/// The local endpoint's role on an established content stream, derived from
/// the content's senders policy and the session role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We push payload bytes to the peer.
    Sending,
    /// The peer pushes payload bytes to us.
    Receiving,
    /// Both sides push.
    Bidirectional,
}

impl Direction {
    /// Whether the local side writes payload onto the stream.
    pub fn is_sending(self) -> bool {
        matches!(self, Direction::Sending | Direction::Bidirectional)
    }
}

// ---------------------------------------------------------------------------
// Negotiation Context
// ---------------------------------------------------------------------------

/// Everything a running transport negotiator needs to talk to the outside:
/// the engine's collaborators, the owning session and the owning content.
///
/// Cloning is cheap; negotiators clone the context into spawned tasks.
#[derive(Clone)]
pub struct NegotiationCtx {
    /// Shared engine internals (channel, connector, relays, registries).
    pub core: Arc<crate::engine::EngineCore>,
    /// The session this negotiation belongs to.
    pub session: Arc<crate::session::Session>,
    /// The content this negotiation belongs to.
    pub content: Arc<crate::content::Content>,
}

impl NegotiationCtx {
    /// The remote endpoint of the session.
    pub fn peer(&self) -> &EndpointId {
        self.session.peer()
    }

    /// Whether the local endpoint initiated the session.
    pub fn is_initiator(&self) -> bool {
        self.session.is_initiator()
    }

    /// Builds a transport-info envelope for this content carrying `info`.
    pub fn info_envelope(&self, info: TransportInfoElement) -> Envelope {
        let transport = TransportElement::info(
            self.content.transport_kind(),
            self.content.stream_id(),
            info,
        );
        Envelope::transport_info(
            self.session.id(),
            self.content.creator(),
            self.content.name(),
            transport,
        )
    }

    /// Fire-and-forget transport-info notification to the peer.
    pub async fn send_info_notify(&self, info: TransportInfoElement) {
        let envelope = self.info_envelope(info);
        self.core.notify(self.peer(), envelope).await;
    }

    /// Transport-info request to the peer, waiting for its response.
    pub async fn send_info_request(
        &self,
        info: TransportInfoElement,
    ) -> Result<ActionResponse, SignalingError> {
        let envelope = self.info_envelope(info);
        self.core.request(self.peer(), envelope).await
    }

    /// Reports payload bytes moved over this content's stream. Description
    /// implementations that drive the transfer themselves call this while
    /// pumping; the owner sees it as a transfer-progress event.
    pub fn report_progress(&self, bytes_transferred: u64) {
        self.core.emit(crate::engine::EngineEvent::TransferProgress {
            session_id: self.session.id().to_string(),
            content_name: self.content.name().to_string(),
            bytes_transferred,
        });
    }
}

// ---------------------------------------------------------------------------
// Component Traits
// ---------------------------------------------------------------------------

/// One live transport negotiation bound to a single content.
///
/// A negotiator produces at most one established byte-stream, handed to the
/// content through `on_transport_ready`, or reports failure exactly once
/// through `on_transport_failed`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The kind identifier this negotiator speaks.
    fn kind(&self) -> TransportKind;

    /// The wire element advertising this side's offer.
    fn element(&self) -> TransportElement;

    /// Folds the peer's answering offer (from session-accept or
    /// transport-accept) into the local negotiation state.
    fn merge_peer_offer(&self, element: &TransportElement);

    /// Starts establishing the byte-stream. Called once, after both sides
    /// have accepted the content.
    async fn establish(&self, direction: Direction, ctx: NegotiationCtx);

    /// Handles an incoming transport-info for this negotiation. Validation
    /// is synchronous; side effects are spawned so the caller's ack is not
    /// delayed.
    fn handle_info(&self, info: &TransportInfoElement, ctx: &NegotiationCtx) -> ActionResponse;

    /// Stops all in-flight work. Called when the transport is replaced or
    /// the content is removed.
    fn abandon(&self);
}

/// Factory for negotiators of one transport kind.
#[async_trait]
pub trait TransportManager: Send + Sync {
    /// The kind identifier this manager mints.
    fn kind(&self) -> TransportKind;

    /// Selection rank. Higher ranks are offered first.
    fn rank(&self) -> u32;

    /// Creates a fresh negotiator making the local side's offer.
    async fn create_for_initiator(&self) -> Result<Arc<dyn Transport>, EngineError>;

    /// Creates a negotiator answering a peer's offer.
    async fn create_for_responder(
        &self,
        offer: &TransportElement,
    ) -> Result<Arc<dyn Transport>, EngineError>;
}

// ---------------------------------------------------------------------------
// Transport Registry
// ---------------------------------------------------------------------------

/// The set of transport kinds this engine can negotiate, ranked.
///
/// Selection is deterministic: managers are kept sorted by descending rank,
/// ties broken by kind identifier, so both peers with equal registries pick
/// the same fallback sequence.
#[derive(Default)]
pub struct TransportRegistry {
    managers: RwLock<Vec<Arc<dyn TransportManager>>>,
}

impl TransportRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a manager, replacing any previous one of the same kind.
    pub fn register(&self, manager: Arc<dyn TransportManager>) {
        let mut managers = self.managers.write();
        managers.retain(|m| m.kind() != manager.kind());
        managers.push(manager);
        managers.sort_by(|a, b| {
            b.rank()
                .cmp(&a.rank())
                .then_with(|| a.kind().as_str().cmp(b.kind().as_str()))
        });
    }

    /// The highest-ranked manager whose kind is not excluded.
    pub fn best(&self, excluding: &HashSet<TransportKind>) -> Option<Arc<dyn TransportManager>> {
        self.managers
            .read()
            .iter()
            .find(|m| !excluding.contains(&m.kind()))
            .cloned()
    }

    /// Looks a manager up by kind.
    pub fn by_kind(&self, kind: &TransportKind) -> Option<Arc<dyn TransportManager>> {
        self.managers.read().iter().find(|m| &m.kind() == kind).cloned()
    }

    /// All registered kinds, best first.
    pub fn kinds(&self) -> Vec<TransportKind> {
        self.managers.read().iter().map(|m| m.kind()).collect()
    }
}
