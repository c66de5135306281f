//! Contents: the unit of negotiation inside a session.
//!
//! A content binds a description (what is exchanged), a transport (how the
//! bytes flow) and an optional security layer (whether the bytes are
//! protected). Its lifecycle is tracked as a set of named flags rather than
//! a single state value, because several conditions hold at once: a content
//! can be awaiting a transport replacement while its previous transmission
//! is already marked failed.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config;
use crate::description::Description;
use crate::engine::{EngineCore, EngineEvent};
use crate::error::{EngineError, TransferFailure};
use crate::security::Security;
use crate::signaling::channel::ByteStream;
use crate::signaling::message::{
    Action, ActionResponse, ContentElement, Creator, Envelope, Reason, Senders, TransportElement,
};
use crate::transport::{Direction, NegotiationCtx, Transport, TransportKind};

// ---------------------------------------------------------------------------
// Lifecycle Flags
// ---------------------------------------------------------------------------

/// One lifecycle condition of a content. Flags are a set: several can hold
/// simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentFlag {
    /// Offered but not yet accepted by the peer.
    PendingAccept,
    /// Accepted; the transport is establishing its byte-stream.
    PendingTransmissionStart,
    /// A transport-replace we proposed is awaiting the peer's answer.
    PendingTransportReplace,
    /// The byte-stream is established and payload is flowing.
    TransmissionInProgress,
    /// The payload was delivered completely.
    TransmissionSuccessful,
    /// The transfer failed and no recovery is in flight.
    TransmissionFailed,
    /// The transfer was cancelled by either side.
    TransmissionCancelled,
}

/// Generates a content name as `cont-<random>`.
pub fn random_content_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(config::CONTENT_NAME_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", config::CONTENT_NAME_PREFIX, suffix)
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

struct ContentState {
    flags: HashSet<ContentFlag>,
    /// Transport kinds that already failed for this content. Never offered
    /// or accepted again.
    blacklist: HashSet<TransportKind>,
    /// The currently negotiating or established transport.
    transport: Arc<dyn Transport>,
    /// Replacement we proposed, promoted on transport-accept.
    pending_replacement: Option<Arc<dyn Transport>>,
}

/// One negotiated unit of exchange within a session.
pub struct Content {
    name: String,
    creator: Creator,
    senders: Senders,
    description: Arc<dyn Description>,
    security: Option<Arc<dyn Security>>,
    state: Mutex<ContentState>,
}

impl Content {
    /// Creates a locally proposed content, pending the peer's accept.
    pub fn new(
        name: String,
        creator: Creator,
        senders: Senders,
        description: Arc<dyn Description>,
        security: Option<Arc<dyn Security>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mut flags = HashSet::new();
        flags.insert(ContentFlag::PendingAccept);
        Self {
            name,
            creator,
            senders,
            description,
            security,
            state: Mutex::new(ContentState {
                flags,
                blacklist: HashSet::new(),
                transport,
                pending_replacement: None,
            }),
        }
    }

    /// Builds a content from a peer's offer, resolving each layer through
    /// the engine's registries.
    pub async fn from_element(core: &EngineCore, element: &ContentElement) -> Result<Self, EngineError> {
        let description_element = element.description.as_ref().ok_or_else(|| {
            EngineError::ProtocolViolation(format!("content {} offered without description", element.name))
        })?;
        let transport_element = element.transport.as_ref().ok_or_else(|| {
            EngineError::ProtocolViolation(format!("content {} offered without transport", element.name))
        })?;

        let description = core.descriptions.resolve(description_element)?;
        let manager = core
            .transports
            .by_kind(&transport_element.kind)
            .ok_or_else(|| EngineError::UnsupportedTransport(transport_element.kind.to_string()))?;
        let transport = manager.create_for_responder(transport_element).await?;
        let security = match &element.security {
            Some(security_element) => Some(core.securities.resolve(security_element)?),
            None => None,
        };

        Ok(Self::new(
            element.name.clone(),
            element.creator,
            element.senders.unwrap_or(Senders::Both),
            description,
            security,
            transport,
        ))
    }

    // -- accessors ----------------------------------------------------------

    /// Content name, unique within the session.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Who proposed this content.
    pub fn creator(&self) -> Creator {
        self.creator
    }

    /// The senders policy agreed for this content.
    pub fn senders(&self) -> Senders {
        self.senders
    }

    /// Kind of the currently active transport.
    pub fn transport_kind(&self) -> TransportKind {
        self.state.lock().transport.kind()
    }

    /// Stream id of the currently active transport.
    pub fn stream_id(&self) -> String {
        self.state.lock().transport.element().stream_id
    }

    /// Whether a lifecycle flag currently holds.
    pub fn has_flag(&self, flag: ContentFlag) -> bool {
        self.state.lock().flags.contains(&flag)
    }

    /// Kinds already blacklisted for this content.
    pub fn blacklisted(&self) -> HashSet<TransportKind> {
        self.state.lock().blacklist.clone()
    }

    /// The wire element describing this content's full current offer.
    pub fn element(&self) -> ContentElement {
        let state = self.state.lock();
        ContentElement {
            creator: self.creator,
            name: self.name.clone(),
            senders: Some(self.senders),
            description: Some(self.description.element()),
            transport: Some(state.transport.element()),
            security: self.security.as_ref().map(|s| s.element()),
        }
    }

    /// Resolves the local stream direction from the senders policy.
    ///
    /// A policy naming neither endpoint cannot be started; accepting such a
    /// content is a protocol violation.
    pub fn direction(&self, is_initiator: bool) -> Result<Direction, EngineError> {
        match (self.senders, is_initiator) {
            (Senders::Both, _) => Ok(Direction::Bidirectional),
            (Senders::Initiator, true) | (Senders::Responder, false) => Ok(Direction::Sending),
            (Senders::Initiator, false) | (Senders::Responder, true) => Ok(Direction::Receiving),
            (Senders::None, _) => Err(EngineError::ProtocolViolation(format!(
                "content {} names no sending party",
                self.name
            ))),
        }
    }

    /// Feeds the peer's answering transport offer into the active transport.
    pub fn merge_peer_offer(&self, element: &TransportElement) {
        self.state.lock().transport.merge_peer_offer(element);
    }

    /// Stops all transport work for this content. A transfer cut short this
    /// way counts as cancelled, not failed.
    pub fn abandon(&self) {
        let mut state = self.state.lock();
        let underway = state.flags.contains(&ContentFlag::PendingTransmissionStart)
            || state.flags.contains(&ContentFlag::TransmissionInProgress);
        let settled = state.flags.contains(&ContentFlag::TransmissionSuccessful)
            || state.flags.contains(&ContentFlag::TransmissionFailed);
        if underway && !settled {
            state.flags.insert(ContentFlag::TransmissionCancelled);
            state.flags.remove(&ContentFlag::TransmissionInProgress);
        }
        state.transport.abandon();
        if let Some(pending) = &state.pending_replacement {
            pending.abandon();
        }
    }

    /// Records the outcome a session terminate implies for an in-progress
    /// transfer. Returns `true` when a success terminate completed it.
    pub(crate) fn note_termination(&self, reason: Reason) -> bool {
        let mut state = self.state.lock();
        if !state.flags.contains(&ContentFlag::TransmissionInProgress) {
            return false;
        }
        match reason {
            Reason::Success => {
                state.flags.remove(&ContentFlag::TransmissionInProgress);
                state.flags.insert(ContentFlag::TransmissionSuccessful);
                true
            }
            Reason::Cancel | Reason::Decline => {
                state.flags.remove(&ContentFlag::TransmissionInProgress);
                state.flags.insert(ContentFlag::TransmissionCancelled);
                false
            }
            _ => false,
        }
    }

    /// Atomically claims the right to propose a transport replacement.
    /// Returns `false` when one is already pending. The claim is made in
    /// the same critical section as the check, so a replace arriving from
    /// the peer between the claim and the outgoing proposal is answered
    /// with a tie-break.
    fn reserve_replacement(&self) -> bool {
        let mut state = self.state.lock();
        if state.flags.contains(&ContentFlag::PendingTransportReplace) {
            return false;
        }
        state.flags.insert(ContentFlag::PendingTransportReplace);
        true
    }

    fn clear_replacement(&self) {
        let mut state = self.state.lock();
        state.pending_replacement = None;
        state.flags.remove(&ContentFlag::PendingTransportReplace);
    }

    // -- lifecycle hooks ----------------------------------------------------

    /// Runs when both sides have accepted this content: clears the pending
    /// flag and starts the transport.
    pub async fn on_accept(&self, ctx: NegotiationCtx) -> Result<(), EngineError> {
        self.state.lock().flags.remove(&ContentFlag::PendingAccept);
        self.start_transport(ctx).await
    }

    /// Starts (or restarts, after a replacement) the active transport.
    async fn start_transport(&self, ctx: NegotiationCtx) -> Result<(), EngineError> {
        let direction = self.direction(ctx.is_initiator())?;
        let transport = {
            let mut state = self.state.lock();
            state.flags.insert(ContentFlag::PendingTransmissionStart);
            Arc::clone(&state.transport)
        };
        debug!(
            session_id = %ctx.session.id(),
            content = %self.name,
            kind = %transport.kind(),
            "starting transport"
        );
        transport.establish(direction, ctx).await;
        Ok(())
    }

    /// Called by the transport when its byte-stream is established. Applies
    /// the security layer, then hands the stream to the description.
    pub async fn on_transport_ready(&self, ctx: NegotiationCtx, stream: ByteStream) {
        let direction = match self.direction(ctx.is_initiator()) {
            Ok(direction) => direction,
            // Unreachable after on_accept validated the policy.
            Err(error) => {
                warn!(content = %self.name, %error, "stream ready for unstartable content");
                return;
            }
        };

        let stream = match &self.security {
            None => stream,
            Some(security) => {
                let wrapped = if direction.is_sending() {
                    security.protect_outgoing(stream).await
                } else {
                    security.protect_incoming(stream).await
                };
                match wrapped {
                    Ok(stream) => stream,
                    Err(error) => {
                        self.on_security_failed(&ctx, error.to_string());
                        return;
                    }
                }
            }
        };

        {
            let mut state = self.state.lock();
            state.flags.remove(&ContentFlag::PendingTransmissionStart);
            state.flags.insert(ContentFlag::TransmissionInProgress);
        }
        info!(
            session_id = %ctx.session.id(),
            content = %self.name,
            kind = %self.transport_kind(),
            "byte-stream established"
        );
        self.description.on_stream_ready(direction, stream, ctx).await;
    }

    fn on_security_failed(&self, ctx: &NegotiationCtx, detail: String) {
        warn!(content = %self.name, %detail, "security layer failed");
        self.state.lock().flags.insert(ContentFlag::TransmissionFailed);
        ctx.core.emit(EngineEvent::TransferFailed {
            session_id: ctx.session.id().to_string(),
            content_name: self.name.clone(),
            failure: TransferFailure::Security(detail),
        });
    }

    /// Called by the transport when it failed for good. Blacklists the kind
    /// and, on the initiator, drives a replacement; the responder waits for
    /// the initiator's transport-replace.
    pub async fn on_transport_failed(&self, ctx: NegotiationCtx) {
        let kind = {
            let mut state = self.state.lock();
            let kind = state.transport.kind();
            state.blacklist.insert(kind.clone());
            state.transport.abandon();
            kind
        };
        warn!(
            session_id = %ctx.session.id(),
            content = %self.name,
            %kind,
            "transport failed, kind blacklisted"
        );
        if !ctx.is_initiator() {
            return;
        }
        if let Err(error) = self.replace_transport(&ctx).await {
            warn!(content = %self.name, %error, "transport replacement failed");
        }
    }

    /// Proposes the next-best transport kind to the peer, or terminates the
    /// session when no kind is left.
    async fn replace_transport(&self, ctx: &NegotiationCtx) -> Result<(), EngineError> {
        // Claimed before the first await: an incoming replace processed
        // while the replacement transport is still being built must see
        // the pending flag and lose the tie-break.
        if !self.reserve_replacement() {
            return Err(EngineError::InvalidState {
                current: "transport replacement already pending".to_string(),
                operation: "replace_transport",
            });
        }
        let blacklist = self.state.lock().blacklist.clone();

        let manager = match ctx.core.transports.best(&blacklist) {
            Some(manager) => manager,
            None => {
                self.clear_replacement();
                self.fail_exhausted(ctx).await;
                return Ok(());
            }
        };

        let replacement = match manager.create_for_initiator().await {
            Ok(replacement) => replacement,
            Err(error) => {
                self.clear_replacement();
                return Err(error);
            }
        };
        let offer = replacement.element();
        self.state.lock().pending_replacement = Some(Arc::clone(&replacement));
        info!(
            session_id = %ctx.session.id(),
            content = %self.name,
            kind = %manager.kind(),
            "proposing transport replacement"
        );

        let envelope =
            Envelope::transport_replace(ctx.session.id(), self.creator, &self.name, offer);
        let result = ctx.core.request(ctx.peer(), envelope).await;
        match result {
            Ok(ActionResponse::Ack) => Ok(()),
            Ok(ActionResponse::TieBreak) => {
                // The peer's own replace was first; ours yields.
                self.clear_replacement();
                Ok(())
            }
            Ok(response) => {
                warn!(content = %self.name, ?response, "transport-replace refused");
                self.clear_replacement();
                Ok(())
            }
            Err(error) => {
                self.clear_replacement();
                Err(error.into())
            }
        }
    }

    /// Every registered kind is blacklisted: terminate the session with
    /// `failed-transport` and surface the failure.
    async fn fail_exhausted(&self, ctx: &NegotiationCtx) {
        self.state.lock().flags.insert(ContentFlag::TransmissionFailed);
        let session_id = ctx.session.id().to_string();
        warn!(%session_id, content = %self.name, "transport kinds exhausted");

        let envelope = Envelope::session_terminate(&session_id, Reason::FailedTransport);
        if let Err(error) = ctx.core.request(ctx.peer(), envelope).await {
            warn!(%session_id, %error, "terminate delivery failed");
        }
        ctx.session.force_end();
        ctx.core.deregister(&session_id);
        ctx.core.emit(EngineEvent::TransferFailed {
            session_id: session_id.clone(),
            content_name: self.name.clone(),
            failure: TransferFailure::NoTransportAvailable,
        });
        ctx.core.emit(EngineEvent::SessionEnded {
            session_id,
            reason: Reason::FailedTransport,
        });
    }

    // -- incoming actions ---------------------------------------------------

    /// Routes a content-scoped action to this content.
    pub async fn handle(
        &self,
        action: Action,
        element: &ContentElement,
        ctx: NegotiationCtx,
    ) -> Result<ActionResponse, EngineError> {
        match action {
            Action::TransportReplace => self.handle_transport_replace(element, ctx).await,
            Action::TransportAccept => Ok(self.handle_transport_accept(element, ctx)),
            Action::TransportReject => Ok(self.handle_transport_reject()),
            Action::TransportInfo => Ok(self.handle_transport_info(element, &ctx)),
            Action::ContentModify | Action::DescriptionInfo | Action::SecurityInfo | Action::SessionInfo => {
                debug!(content = %self.name, ?action, "informational action acknowledged");
                Ok(ActionResponse::Ack)
            }
            _ => Err(EngineError::ProtocolViolation(format!(
                "action {action:?} is not content-scoped"
            ))),
        }
    }

    async fn handle_transport_replace(
        &self,
        element: &ContentElement,
        ctx: NegotiationCtx,
    ) -> Result<ActionResponse, EngineError> {
        let offer = match &element.transport {
            Some(offer) => offer,
            None => return Ok(ActionResponse::MalformedRequest),
        };

        {
            let state = self.state.lock();
            // Concurrent replaces: the first mover wins, and from the
            // receiver's view its own outstanding proposal was first.
            if state.flags.contains(&ContentFlag::PendingTransportReplace) {
                return Ok(ActionResponse::TieBreak);
            }
        }

        let manager = ctx.core.transports.by_kind(&offer.kind);
        let acceptable = manager.is_some() && !self.state.lock().blacklist.contains(&offer.kind);
        if !acceptable {
            info!(
                content = %self.name,
                kind = %offer.kind,
                "rejecting transport replacement"
            );
            let envelope = Envelope::transport_reject(
                ctx.session.id(),
                self.creator,
                &self.name,
                offer.clone(),
            );
            let core = Arc::clone(&ctx.core);
            let peer = ctx.peer().clone();
            tokio::spawn(async move { core.notify(&peer, envelope).await });
            return Ok(ActionResponse::Ack);
        }

        let manager = manager.ok_or(EngineError::NoTransportAvailable)?;
        let replacement = manager.create_for_responder(offer).await?;
        let accept_element = replacement.element();
        {
            let mut state = self.state.lock();
            let old_kind = state.transport.kind();
            state.transport.abandon();
            state.blacklist.insert(old_kind);
            state.transport = replacement;
            state.flags.remove(&ContentFlag::TransmissionFailed);
        }

        let envelope = Envelope::transport_accept(
            ctx.session.id(),
            self.creator,
            &self.name,
            accept_element,
        );
        let content = Arc::clone(&ctx.content);
        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(error) = task_ctx.core.request(task_ctx.peer(), envelope).await {
                warn!(content = %content.name(), %error, "transport-accept delivery failed");
                return;
            }
            if let Err(error) = content.start_transport(task_ctx.clone()).await {
                warn!(content = %content.name(), %error, "replacement transport start failed");
            }
        });
        Ok(ActionResponse::Ack)
    }

    fn handle_transport_accept(&self, element: &ContentElement, ctx: NegotiationCtx) -> ActionResponse {
        {
            let mut state = self.state.lock();
            if !state.flags.contains(&ContentFlag::PendingTransportReplace) {
                return ActionResponse::OutOfOrder;
            }
            let replacement = match state.pending_replacement.take() {
                Some(replacement) => replacement,
                None => return ActionResponse::OutOfOrder,
            };
            state.flags.remove(&ContentFlag::PendingTransportReplace);
            state.flags.remove(&ContentFlag::TransmissionFailed);
            if let Some(answer) = element.transport.as_ref() {
                replacement.merge_peer_offer(answer);
            }
            state.transport = replacement;
        }

        let content = Arc::clone(&ctx.content);
        tokio::spawn(async move {
            if let Err(error) = content.start_transport(ctx).await {
                warn!(content = %content.name(), %error, "replacement transport start failed");
            }
        });
        ActionResponse::Ack
    }

    fn handle_transport_reject(&self) -> ActionResponse {
        let mut state = self.state.lock();
        if let Some(rejected) = state.pending_replacement.take() {
            rejected.abandon();
        }
        state.flags.remove(&ContentFlag::PendingTransportReplace);
        warn!(content = %self.name, "transport replacement rejected by peer");
        ActionResponse::Ack
    }

    fn handle_transport_info(&self, element: &ContentElement, ctx: &NegotiationCtx) -> ActionResponse {
        let transport_element = match &element.transport {
            Some(transport) => transport,
            None => return ActionResponse::MalformedRequest,
        };
        let info = match &transport_element.info {
            Some(info) => info,
            None => return ActionResponse::MalformedRequest,
        };
        let transport = {
            let state = self.state.lock();
            if state.transport.kind() != transport_element.kind {
                return ActionResponse::OutOfOrder;
            }
            Arc::clone(&state.transport)
        };
        transport.handle_info(info, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{FileDescription, FileMetadata};
    use crate::transport::candidate::CandidateSet;
    use crate::transport::socket::test_support::idle_socket_transport;

    fn file_description() -> Arc<dyn Description> {
        Arc::new(FileDescription::new(FileMetadata {
            name: "notes.txt".to_string(),
            size: Some(12),
            media_type: None,
            hash: None,
        }))
    }

    fn content(senders: Senders) -> Content {
        Content::new(
            "a".to_string(),
            Creator::Initiator,
            senders,
            file_description(),
            None,
            idle_socket_transport("stream-1", CandidateSet::new()),
        )
    }

    #[test]
    fn fresh_content_is_pending_accept() {
        let content = content(Senders::Both);
        assert!(content.has_flag(ContentFlag::PendingAccept));
        assert!(!content.has_flag(ContentFlag::TransmissionInProgress));
    }

    #[test]
    fn flags_can_coexist() {
        let content = content(Senders::Both);
        {
            let mut state = content.state.lock();
            state.flags.insert(ContentFlag::TransmissionFailed);
            state.flags.insert(ContentFlag::PendingTransportReplace);
        }
        assert!(content.has_flag(ContentFlag::TransmissionFailed));
        assert!(content.has_flag(ContentFlag::PendingTransportReplace));
        assert!(content.has_flag(ContentFlag::PendingAccept));
    }

    #[test]
    fn direction_follows_senders_policy_and_role() {
        let initiator_sends = content(Senders::Initiator);
        assert!(matches!(initiator_sends.direction(true), Ok(Direction::Sending)));
        assert!(matches!(initiator_sends.direction(false), Ok(Direction::Receiving)));

        let responder_sends = content(Senders::Responder);
        assert!(matches!(responder_sends.direction(true), Ok(Direction::Receiving)));
        assert!(matches!(responder_sends.direction(false), Ok(Direction::Sending)));

        let both = content(Senders::Both);
        assert!(matches!(both.direction(true), Ok(Direction::Bidirectional)));
    }

    #[test]
    fn senders_none_cannot_start() {
        let content = content(Senders::None);
        assert!(matches!(
            content.direction(true),
            Err(EngineError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn random_names_carry_the_prefix() {
        let name = random_content_name();
        assert!(name.starts_with(config::CONTENT_NAME_PREFIX));
        assert_eq!(
            name.len(),
            config::CONTENT_NAME_PREFIX.len() + config::CONTENT_NAME_RANDOM_LEN
        );
        assert_ne!(name, random_content_name());
    }

    #[test]
    fn terminate_outcomes_settle_in_progress_transfers() {
        let succeeded = content(Senders::Both);
        succeeded.state.lock().flags.insert(ContentFlag::TransmissionInProgress);
        assert!(succeeded.note_termination(Reason::Success));
        assert!(succeeded.has_flag(ContentFlag::TransmissionSuccessful));
        assert!(!succeeded.has_flag(ContentFlag::TransmissionInProgress));

        // Only a first-time completion reports true.
        assert!(!succeeded.note_termination(Reason::Success));

        let cancelled = content(Senders::Both);
        cancelled.state.lock().flags.insert(ContentFlag::TransmissionInProgress);
        assert!(!cancelled.note_termination(Reason::Cancel));
        assert!(cancelled.has_flag(ContentFlag::TransmissionCancelled));

        // Other reasons leave the outcome to the failure path.
        let failed = content(Senders::Both);
        failed.state.lock().flags.insert(ContentFlag::TransmissionInProgress);
        assert!(!failed.note_termination(Reason::FailedTransport));
        assert!(failed.has_flag(ContentFlag::TransmissionInProgress));
        assert!(!failed.has_flag(ContentFlag::TransmissionCancelled));
    }

    #[test]
    fn replacement_reservation_is_exclusive() {
        let content = content(Senders::Both);
        assert!(content.reserve_replacement());
        assert!(content.has_flag(ContentFlag::PendingTransportReplace));

        // A second proposer in the same window loses; an incoming replace
        // checking the flag now answers tie-break.
        assert!(!content.reserve_replacement());

        content.clear_replacement();
        assert!(!content.has_flag(ContentFlag::PendingTransportReplace));
        assert!(content.reserve_replacement());
    }

    #[test]
    fn abandoning_an_underway_transfer_marks_it_cancelled() {
        let underway = content(Senders::Both);
        underway.state.lock().flags.insert(ContentFlag::TransmissionInProgress);
        underway.abandon();
        assert!(underway.has_flag(ContentFlag::TransmissionCancelled));
        assert!(!underway.has_flag(ContentFlag::TransmissionInProgress));

        // A settled transfer stays settled.
        let settled = content(Senders::Both);
        {
            let mut state = settled.state.lock();
            state.flags.insert(ContentFlag::TransmissionSuccessful);
        }
        settled.abandon();
        assert!(!settled.has_flag(ContentFlag::TransmissionCancelled));
    }

    #[test]
    fn transport_reject_clears_the_pending_replacement() {
        let content = content(Senders::Both);
        {
            let mut state = content.state.lock();
            state.pending_replacement =
                Some(idle_socket_transport("stream-2", CandidateSet::new()));
            state.flags.insert(ContentFlag::PendingTransportReplace);
        }
        assert_eq!(content.handle_transport_reject(), ActionResponse::Ack);
        assert!(!content.has_flag(ContentFlag::PendingTransportReplace));
        assert!(content.state.lock().pending_replacement.is_none());
    }
}
