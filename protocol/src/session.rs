//! Sessions: the negotiation unit between two endpoints.
//!
//! A session advances monotonically through `Fresh → Pending → Active →
//! Ended`; `Ended` is absorbing. Incoming actions for one session are
//! serialized through a dispatch lock so the per-action state checks stay
//! race-free; side effects (candidate races, stream pumps) run in spawned
//! tasks and never hold that lock.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::content::{Content, ContentFlag};
use crate::engine::{EngineCore, EngineEvent};
use crate::error::{EngineError, TransferFailure};
use crate::signaling::message::{
    Action, ActionResponse, ContentElement, Creator, EndpointId, Envelope, Reason,
};
use crate::transport::NegotiationCtx;

// ---------------------------------------------------------------------------
// Role & State
// ---------------------------------------------------------------------------

/// The local endpoint's role in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We sent the session-initiate.
    Initiator,
    /// We received it.
    Responder,
}

/// Lifecycle state of a session. Ordered so transitions only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Created locally, session-initiate not yet sent.
    Fresh,
    /// Initiate sent or received; awaiting session-accept.
    Pending,
    /// Accepted by both sides; contents are negotiating transports.
    Active,
    /// Terminated. Absorbing: no action revives an ended session.
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Fresh => "fresh",
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Ended => "ended",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One negotiation session with a single peer.
pub struct Session {
    id: String,
    initiator: EndpointId,
    responder: EndpointId,
    role: Role,
    state: parking_lot::RwLock<SessionState>,
    /// Contents agreed by both sides.
    contents: DashMap<String, Arc<Content>>,
    /// Contents proposed (by either side) and not yet accepted.
    proposed: DashMap<String, Arc<Content>>,
    /// Serializes incoming action handling for this session.
    dispatch: tokio::sync::Mutex<()>,
}

impl Session {
    /// Creates a locally initiated session, not yet announced to the peer.
    pub fn new_initiated(
        id: String,
        initiator: EndpointId,
        responder: EndpointId,
        contents: Vec<Arc<Content>>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id,
            initiator,
            responder,
            role: Role::Initiator,
            state: parking_lot::RwLock::new(SessionState::Fresh),
            contents: DashMap::new(),
            proposed: DashMap::new(),
            dispatch: tokio::sync::Mutex::new(()),
        });
        for content in contents {
            session.contents.insert(content.name().to_string(), content);
        }
        session
    }

    /// Builds a session from a peer's session-initiate, resolving every
    /// offered content through the engine's registries.
    pub async fn from_initiate(
        core: &EngineCore,
        local: EndpointId,
        envelope: &Envelope,
    ) -> Result<Arc<Self>, EngineError> {
        let initiator = envelope
            .initiator
            .clone()
            .ok_or_else(|| EngineError::ProtocolViolation("session-initiate without initiator".to_string()))?;
        if envelope.contents.is_empty() {
            return Err(EngineError::ProtocolViolation(
                "session-initiate without contents".to_string(),
            ));
        }

        let session = Arc::new(Self {
            id: envelope.session_id.clone(),
            initiator,
            responder: local,
            role: Role::Responder,
            state: parking_lot::RwLock::new(SessionState::Pending),
            contents: DashMap::new(),
            proposed: DashMap::new(),
            dispatch: tokio::sync::Mutex::new(()),
        });
        for element in &envelope.contents {
            if session.contents.contains_key(&element.name) {
                return Err(EngineError::ProtocolViolation(format!(
                    "duplicate content name {}",
                    element.name
                )));
            }
            let content = Content::from_element(core, element).await?;
            session.contents.insert(element.name.clone(), Arc::new(content));
        }
        Ok(session)
    }

    // -- accessors ----------------------------------------------------------

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The remote endpoint.
    pub fn peer(&self) -> &EndpointId {
        match self.role {
            Role::Initiator => &self.responder,
            Role::Responder => &self.initiator,
        }
    }

    /// The local endpoint's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the local endpoint initiated this session.
    pub fn is_initiator(&self) -> bool {
        self.role == Role::Initiator
    }

    /// The creator tag for contents the local endpoint proposes.
    pub fn local_creator(&self) -> Creator {
        match self.role {
            Role::Initiator => Creator::Initiator,
            Role::Responder => Creator::Responder,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Looks an agreed content up by name.
    pub fn content(&self, name: &str) -> Option<Arc<Content>> {
        self.contents.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Looks a proposed (not yet accepted) content up by name.
    pub fn proposed_content(&self, name: &str) -> Option<Arc<Content>> {
        self.proposed.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of the agreed contents.
    pub fn contents(&self) -> Vec<Arc<Content>> {
        self.contents.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Advances the state, never backwards.
    fn advance(&self, target: SessionState) {
        let mut state = self.state.write();
        if target > *state {
            *state = target;
        }
    }

    /// Marks the session ended and stops all content work.
    pub fn force_end(&self) {
        self.advance(SessionState::Ended);
        for entry in self.contents.iter() {
            entry.value().abandon();
        }
        for entry in self.proposed.iter() {
            entry.value().abandon();
        }
    }

    fn ctx(self: &Arc<Self>, core: &Arc<EngineCore>, content: &Arc<Content>) -> NegotiationCtx {
        NegotiationCtx {
            core: Arc::clone(core),
            session: Arc::clone(self),
            content: Arc::clone(content),
        }
    }

    // -- outgoing flow ------------------------------------------------------

    /// Sends the session-initiate. On acknowledgment the session becomes
    /// pending; on delivery failure it is left untouched for the caller.
    pub async fn initiate(self: &Arc<Self>, core: &Arc<EngineCore>) -> Result<(), EngineError> {
        if self.role != Role::Initiator || self.state() != SessionState::Fresh {
            return Err(EngineError::InvalidState {
                current: self.state().to_string(),
                operation: "initiate",
            });
        }
        let elements: Vec<ContentElement> =
            self.contents().iter().map(|content| content.element()).collect();
        let envelope = Envelope::session_initiate(
            self.initiator.clone(),
            self.responder.clone(),
            &self.id,
            elements,
        );
        match core.request(self.peer(), envelope).await? {
            ActionResponse::Ack => {
                self.advance(SessionState::Pending);
                info!(session_id = %self.id, peer = %self.peer(), "session initiated");
                Ok(())
            }
            response => Err(EngineError::ProtocolViolation(format!(
                "session-initiate refused: {response:?}"
            ))),
        }
    }

    /// Accepts a pending incoming session: answers with our transport
    /// offers, then starts every content.
    pub async fn accept(self: &Arc<Self>, core: &Arc<EngineCore>) -> Result<(), EngineError> {
        let _guard = self.dispatch.lock().await;
        if self.role != Role::Responder || self.state() != SessionState::Pending {
            return Err(EngineError::InvalidState {
                current: self.state().to_string(),
                operation: "accept",
            });
        }
        let contents = self.contents();
        let elements: Vec<ContentElement> =
            contents.iter().map(|content| content.element()).collect();
        // Contents start negotiating before the accept goes out, so the
        // local side is ready for the peer's candidate notifications the
        // moment the accept lands.
        for content in &contents {
            content.on_accept(self.ctx(core, content)).await?;
        }
        let envelope = Envelope::session_accept(
            self.initiator.clone(),
            self.responder.clone(),
            &self.id,
            elements,
        );
        match core.request(self.peer(), envelope).await? {
            ActionResponse::Ack => {}
            response => {
                return Err(EngineError::ProtocolViolation(format!(
                    "session-accept refused: {response:?}"
                )))
            }
        }
        self.advance(SessionState::Active);
        info!(session_id = %self.id, "session accepted");
        Ok(())
    }

    /// Terminates the session locally and informs the peer.
    pub async fn terminate(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        reason: Reason,
    ) -> Result<(), EngineError> {
        let _guard = self.dispatch.lock().await;
        if self.state() == SessionState::Ended {
            return Ok(());
        }
        for content in self.contents() {
            if content.note_termination(reason) {
                core.emit(EngineEvent::TransferCompleted {
                    session_id: self.id.clone(),
                    content_name: content.name().to_string(),
                });
            }
        }
        self.force_end();
        core.deregister(&self.id);
        let envelope = Envelope::session_terminate(&self.id, reason);
        if let Err(error) = core.request(self.peer(), envelope).await {
            warn!(session_id = %self.id, %error, "terminate delivery failed");
        }
        core.emit(EngineEvent::SessionEnded {
            session_id: self.id.clone(),
            reason,
        });
        info!(session_id = %self.id, %reason, "session terminated locally");
        Ok(())
    }

    /// Proposes a locally created content to the peer with content-add.
    pub async fn add_content(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        content: Arc<Content>,
    ) -> Result<(), EngineError> {
        let _guard = self.dispatch.lock().await;
        if self.state() != SessionState::Active {
            return Err(EngineError::InvalidState {
                current: self.state().to_string(),
                operation: "add_content",
            });
        }
        let name = content.name().to_string();
        if self.contents.contains_key(&name) || self.proposed.contains_key(&name) {
            return Err(EngineError::ProtocolViolation(format!(
                "content name {name} already in use"
            )));
        }
        let envelope = Envelope::content_add(&self.id, content.element());
        self.proposed.insert(name.clone(), Arc::clone(&content));
        match core.request(self.peer(), envelope).await {
            Ok(ActionResponse::Ack) => Ok(()),
            Ok(response) => {
                self.proposed.remove(&name);
                Err(EngineError::ProtocolViolation(format!(
                    "content-add refused: {response:?}"
                )))
            }
            Err(error) => {
                self.proposed.remove(&name);
                Err(error.into())
            }
        }
    }

    /// Accepts a peer-proposed content and starts its transport.
    pub async fn accept_content(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        name: &str,
    ) -> Result<(), EngineError> {
        let _guard = self.dispatch.lock().await;
        let content = self.proposed_content(name).ok_or_else(|| EngineError::InvalidState {
            current: format!("content {name} is not pending acceptance"),
            operation: "accept_content",
        })?;
        let envelope = Envelope::content_accept(&self.id, vec![content.element()]);
        match core.request(self.peer(), envelope).await? {
            ActionResponse::Ack => {}
            response => {
                return Err(EngineError::ProtocolViolation(format!(
                    "content-accept refused: {response:?}"
                )))
            }
        }
        self.proposed.remove(name);
        self.contents.insert(name.to_string(), Arc::clone(&content));
        content.on_accept(self.ctx(core, &content)).await
    }

    /// Rejects a peer-proposed content.
    pub async fn reject_content(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        name: &str,
    ) -> Result<(), EngineError> {
        let _guard = self.dispatch.lock().await;
        let (name, content) = self.proposed.remove(name).ok_or_else(|| EngineError::InvalidState {
            current: format!("content {name} is not pending acceptance"),
            operation: "reject_content",
        })?;
        content.abandon();
        let envelope = Envelope::content_reject(
            &self.id,
            vec![ContentElement::named(content.creator(), &name)],
        );
        core.request(self.peer(), envelope).await?;
        Ok(())
    }

    /// Removes an agreed content and stops its transport.
    pub async fn remove_content(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        name: &str,
    ) -> Result<(), EngineError> {
        let _guard = self.dispatch.lock().await;
        let (name, content) = self.contents.remove(name).ok_or_else(|| EngineError::InvalidState {
            current: format!("content {name} is not active"),
            operation: "remove_content",
        })?;
        content.abandon();
        let envelope = Envelope::content_remove(
            &self.id,
            vec![ContentElement::named(content.creator(), &name)],
        );
        core.request(self.peer(), envelope).await?;
        Ok(())
    }

    // -- incoming dispatch ----------------------------------------------------

    /// Handles one incoming action for this session.
    pub async fn handle(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        envelope: &Envelope,
    ) -> Result<ActionResponse, EngineError> {
        let _guard = self.dispatch.lock().await;
        if self.state() == SessionState::Ended {
            return Ok(ActionResponse::UnknownSession);
        }
        match envelope.action {
            Action::SessionInitiate => Ok(ActionResponse::OutOfOrder),
            Action::SessionAccept => self.handle_session_accept(core, envelope),
            Action::SessionTerminate => self.handle_session_terminate(core, envelope),
            Action::ContentAdd => self.handle_content_add(core, envelope).await,
            Action::ContentAccept => self.handle_content_accept(core, envelope),
            Action::ContentReject => self.handle_content_reject(core, envelope),
            Action::ContentRemove => self.handle_content_remove(core, envelope),
            action if action.is_content_scoped() => self.handle_content_scoped(core, envelope).await,
            action => Err(EngineError::ProtocolViolation(format!(
                "unroutable action {action:?}"
            ))),
        }
    }

    fn handle_session_accept(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        envelope: &Envelope,
    ) -> Result<ActionResponse, EngineError> {
        if self.role != Role::Initiator || self.state() != SessionState::Pending {
            return Ok(ActionResponse::OutOfOrder);
        }
        // Every content must be answered; a partial accept is malformed.
        let mut pairs = Vec::with_capacity(envelope.contents.len());
        for element in &envelope.contents {
            match self.content(&element.name) {
                Some(content) => pairs.push((content, element)),
                None => {
                    return Err(EngineError::ProtocolViolation(format!(
                        "session-accept answers unknown content {}",
                        element.name
                    )))
                }
            }
        }
        for content in self.contents() {
            if !pairs.iter().any(|(c, _)| c.name() == content.name()) {
                return Err(EngineError::ProtocolViolation(format!(
                    "session-accept does not answer content {}",
                    content.name()
                )));
            }
        }

        self.advance(SessionState::Active);
        info!(session_id = %self.id, "session accepted by peer");
        for (content, element) in pairs {
            if let Some(transport) = &element.transport {
                content.merge_peer_offer(transport);
            }
            let ctx = self.ctx(core, &content);
            let content = Arc::clone(&content);
            tokio::spawn(async move {
                if let Err(error) = content.on_accept(ctx).await {
                    warn!(content = %content.name(), %error, "content start failed");
                }
            });
        }
        Ok(ActionResponse::Ack)
    }

    fn handle_session_terminate(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        envelope: &Envelope,
    ) -> Result<ActionResponse, EngineError> {
        let reason = envelope.reason.ok_or_else(|| {
            EngineError::ProtocolViolation("session-terminate without reason".to_string())
        })?;
        info!(session_id = %self.id, %reason, "session terminated by peer");

        // Transfers still in flight fail with the peer's reason; a success
        // terminate completes them instead.
        for content in self.contents() {
            let in_flight = content.has_flag(ContentFlag::PendingTransmissionStart)
                || content.has_flag(ContentFlag::TransmissionInProgress)
                || content.has_flag(ContentFlag::PendingTransportReplace);
            if content.note_termination(reason) {
                core.emit(EngineEvent::TransferCompleted {
                    session_id: self.id.clone(),
                    content_name: content.name().to_string(),
                });
            } else if in_flight && reason != Reason::Success {
                core.emit(EngineEvent::TransferFailed {
                    session_id: self.id.clone(),
                    content_name: content.name().to_string(),
                    failure: TransferFailure::PeerTerminated(reason),
                });
            }
        }
        self.force_end();
        core.deregister(&self.id);
        core.emit(EngineEvent::SessionEnded {
            session_id: self.id.clone(),
            reason,
        });
        Ok(ActionResponse::Ack)
    }

    async fn handle_content_add(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        envelope: &Envelope,
    ) -> Result<ActionResponse, EngineError> {
        let element = match envelope.contents.as_slice() {
            [element] => element,
            _ => {
                return Err(EngineError::ProtocolViolation(
                    "content-add must carry exactly one content".to_string(),
                ))
            }
        };
        if self.contents.contains_key(&element.name) || self.proposed.contains_key(&element.name) {
            return Err(EngineError::ProtocolViolation(format!(
                "content name {} already in use",
                element.name
            )));
        }
        let content = match Content::from_element(core, element).await {
            Ok(content) => Arc::new(content),
            Err(
                EngineError::UnsupportedDescription(_)
                | EngineError::UnsupportedTransport(_)
                | EngineError::UnsupportedSecurity(_),
            ) => {
                // Not a violation: decline the proposal and move on.
                let reject = Envelope::content_reject(
                    &self.id,
                    vec![ContentElement::named(element.creator, &element.name)],
                );
                let core = Arc::clone(core);
                let peer = self.peer().clone();
                tokio::spawn(async move { core.notify(&peer, reject).await });
                return Ok(ActionResponse::Ack);
            }
            Err(error) => return Err(error),
        };

        let description_kind = element
            .description
            .as_ref()
            .map(|d| d.kind.clone())
            .unwrap_or_default();
        self.proposed.insert(element.name.clone(), content);
        core.emit(EngineEvent::ContentOffer {
            session_id: self.id.clone(),
            content_name: element.name.clone(),
            description_kind,
        });
        Ok(ActionResponse::Ack)
    }

    fn handle_content_accept(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        envelope: &Envelope,
    ) -> Result<ActionResponse, EngineError> {
        for element in &envelope.contents {
            let (name, content) = self.proposed.remove(&element.name).ok_or_else(|| {
                EngineError::ProtocolViolation(format!(
                    "content-accept for unproposed content {}",
                    element.name
                ))
            })?;
            if let Some(transport) = &element.transport {
                content.merge_peer_offer(transport);
            }
            self.contents.insert(name, Arc::clone(&content));
            let ctx = self.ctx(core, &content);
            tokio::spawn(async move {
                if let Err(error) = ctx.content.on_accept(ctx.clone()).await {
                    warn!(content = %ctx.content.name(), %error, "content start failed");
                }
            });
        }
        Ok(ActionResponse::Ack)
    }

    fn handle_content_reject(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        envelope: &Envelope,
    ) -> Result<ActionResponse, EngineError> {
        for element in &envelope.contents {
            let (name, content) = self.proposed.remove(&element.name).ok_or_else(|| {
                EngineError::ProtocolViolation(format!(
                    "content-reject for unproposed content {}",
                    element.name
                ))
            })?;
            content.abandon();
            info!(session_id = %self.id, content = %name, "content rejected by peer");
            core.emit(EngineEvent::ContentRemoved {
                session_id: self.id.clone(),
                content_name: name,
            });
        }
        Ok(ActionResponse::Ack)
    }

    fn handle_content_remove(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        envelope: &Envelope,
    ) -> Result<ActionResponse, EngineError> {
        for element in &envelope.contents {
            let (name, content) = self.contents.remove(&element.name).ok_or_else(|| {
                EngineError::ProtocolViolation(format!(
                    "content-remove for unknown content {}",
                    element.name
                ))
            })?;
            content.abandon();
            info!(session_id = %self.id, content = %name, "content removed by peer");
            core.emit(EngineEvent::ContentRemoved {
                session_id: self.id.clone(),
                content_name: name,
            });
        }
        Ok(ActionResponse::Ack)
    }

    async fn handle_content_scoped(
        self: &Arc<Self>,
        core: &Arc<EngineCore>,
        envelope: &Envelope,
    ) -> Result<ActionResponse, EngineError> {
        let element = match envelope.contents.as_slice() {
            [element] => element,
            _ => {
                return Err(EngineError::ProtocolViolation(format!(
                    "{:?} must name exactly one content",
                    envelope.action
                )))
            }
        };
        let content = match self.content(&element.name) {
            Some(content) => content,
            None => {
                // A content still awaiting acceptance is known but has no
                // negotiation to route to; only a name nobody proposed is
                // a violation.
                if self.proposed.contains_key(&element.name) {
                    return Ok(ActionResponse::ItemNotFound);
                }
                return Err(EngineError::ProtocolViolation(format!(
                    "{:?} names unknown content {}",
                    envelope.action, element.name
                )));
            }
        };
        let ctx = self.ctx(core, &content);
        content.handle(envelope.action, element, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Arc<Session> {
        Session::new_initiated(
            "session-1".to_string(),
            EndpointId::new("alice@example/a"),
            EndpointId::new("bob@example/b"),
            Vec::new(),
        )
    }

    #[test]
    fn fresh_session_has_initiator_role() {
        let session = session();
        assert_eq!(session.state(), SessionState::Fresh);
        assert!(session.is_initiator());
        assert_eq!(session.local_creator(), Creator::Initiator);
        assert_eq!(session.peer().as_str(), "bob@example/b");
    }

    #[test]
    fn state_only_advances() {
        let session = session();
        session.advance(SessionState::Active);
        assert_eq!(session.state(), SessionState::Active);

        // Regressions are ignored.
        session.advance(SessionState::Pending);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn ended_is_absorbing() {
        let session = session();
        session.force_end();
        assert_eq!(session.state(), SessionState::Ended);

        session.advance(SessionState::Active);
        assert_eq!(session.state(), SessionState::Ended);

        // force_end stays idempotent.
        session.force_end();
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[test]
    fn state_ordering_matches_lifecycle() {
        assert!(SessionState::Fresh < SessionState::Pending);
        assert!(SessionState::Pending < SessionState::Active);
        assert!(SessionState::Active < SessionState::Ended);
    }
}
