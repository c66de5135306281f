//! Typed wire model for the negotiation protocol.
//!
//! These are the structured messages the engine exchanges over the signaling
//! channel. Encoding to and from the channel's concrete byte format is the
//! codec's job (an external collaborator); the engine only ever sees these
//! types. Every outgoing message shape has a constructor here so handler
//! code never assembles envelopes field by field.
//!
//! ## Envelope anatomy
//!
//! ```text
//! Envelope {
//!     session_id, action,
//!     initiator?, responder?,          // endpoint identities
//!     contents: [ContentElement...],   // affected contents
//!     reason?,                         // mandatory on session-terminate
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transport::candidate::CandidateSet;
use crate::transport::TransportKind;

// ---------------------------------------------------------------------------
// Endpoint Identity
// ---------------------------------------------------------------------------

/// Opaque identity of a networked endpoint on the signaling channel.
///
/// The engine never interprets the contents; addressing, authentication and
/// routing belong to the channel implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Wraps a channel-specific address string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Protocol Actions
// ---------------------------------------------------------------------------

/// The action tag of a signaling request.
///
/// Session-scoped actions are handled by the session engine itself;
/// content-scoped actions are routed to the single content named in the
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    SessionInitiate,
    SessionAccept,
    SessionInfo,
    SessionTerminate,
    ContentAccept,
    ContentAdd,
    ContentModify,
    ContentReject,
    ContentRemove,
    DescriptionInfo,
    SecurityInfo,
    TransportAccept,
    TransportInfo,
    TransportReject,
    TransportReplace,
}

impl Action {
    /// Returns `true` for actions that must name exactly one existing
    /// content and are dispatched to that content's negotiator.
    pub fn is_content_scoped(self) -> bool {
        matches!(
            self,
            Action::ContentModify
                | Action::DescriptionInfo
                | Action::SecurityInfo
                | Action::SessionInfo
                | Action::TransportAccept
                | Action::TransportInfo
                | Action::TransportReject
                | Action::TransportReplace
        )
    }
}

// ---------------------------------------------------------------------------
// Synchronous Acknowledgment
// ---------------------------------------------------------------------------

/// The synchronous response to a signaling request.
///
/// This is what the receiving engine returns from its delivery path, before
/// (and independently of) any background side effects the request triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionResponse {
    /// Request received and accepted for processing.
    Ack,
    /// Duplicate concurrent negotiation action lost the tie-break; the
    /// first mover wins and the loser is expected to retry or yield.
    TieBreak,
    /// The request does not fit the receiver's current negotiation state.
    OutOfOrder,
    /// The request is structurally invalid (e.g. it references an unknown
    /// candidate).
    MalformedRequest,
    /// The named session is not registered at the receiver.
    UnknownSession,
    /// The named content (or other item) does not exist.
    ItemNotFound,
}

// ---------------------------------------------------------------------------
// Content Roles
// ---------------------------------------------------------------------------

/// Which party originally proposed a content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Creator {
    Initiator,
    Responder,
}

/// Which party/parties push data over an accepted content's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Senders {
    /// Only the session initiator sends.
    Initiator,
    /// Only the session responder sends.
    Responder,
    /// Both parties send.
    Both,
    /// Nobody sends. Accepting a content with this policy is a protocol
    /// violation, as it designates neither endpoint.
    None,
}

// ---------------------------------------------------------------------------
// Termination Reasons
// ---------------------------------------------------------------------------

/// Reason code carried by a session-terminate.
///
/// A terminate without a reason is a protocol error; the receiver treats the
/// absence as a violation rather than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    Success,
    Decline,
    Busy,
    Cancel,
    ConnectivityError,
    FailedApplication,
    FailedTransport,
    SecurityError,
    Timeout,
    UnsupportedApplications,
    UnsupportedTransports,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Success => "success",
            Reason::Decline => "decline",
            Reason::Busy => "busy",
            Reason::Cancel => "cancel",
            Reason::ConnectivityError => "connectivity-error",
            Reason::FailedApplication => "failed-application",
            Reason::FailedTransport => "failed-transport",
            Reason::SecurityError => "security-error",
            Reason::Timeout => "timeout",
            Reason::UnsupportedApplications => "unsupported-applications",
            Reason::UnsupportedTransports => "unsupported-transports",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Content Sub-Elements
// ---------------------------------------------------------------------------

/// Wire form of a content's description layer: what is being exchanged.
///
/// The payload is kind-specific and opaque to the negotiation engine; the
/// registered description adapter for `kind` interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionElement {
    /// Description kind identifier (e.g. `"file"`).
    pub kind: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Wire form of a content's transport layer: how the bytes will flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportElement {
    /// Transport kind identifier (e.g. `"socket"`, `"in-band"`).
    pub kind: TransportKind,
    /// Identifier correlating both sides' view of one byte-stream.
    pub stream_id: String,
    /// Offered connection candidates, in the offerer's preference order.
    #[serde(default)]
    pub candidates: CandidateSet,
    /// In-band negotiation payload (candidate notifications, data chunks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<TransportInfoElement>,
    /// Negotiated chunk size for block-oriented transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<usize>,
}

impl TransportElement {
    /// An element carrying only an info payload, for transport-info
    /// notifications about an already-offered transport.
    pub fn info(kind: TransportKind, stream_id: impl Into<String>, info: TransportInfoElement) -> Self {
        Self {
            kind,
            stream_id: stream_id.into(),
            candidates: CandidateSet::new(),
            info: Some(info),
            block_size: None,
        }
    }
}

/// Payload of a transport-info action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportInfoElement {
    /// The sender connected to the peer-offered candidate with this id.
    CandidateUsed { candidate_id: String },
    /// The sender failed to connect to every offered candidate.
    CandidateError,
    /// The sender activated its relay candidate with this id; the stream is
    /// now usable through it.
    CandidateActivated { candidate_id: String },
    /// The sender failed to activate its relay candidate.
    ProxyError,
    /// One ordered chunk of an in-band byte-stream.
    Data { seq: u64, payload: Vec<u8> },
}

/// Wire form of a content's security layer: whether/how the payload is
/// end-to-end protected. The payload is interpreted by the registered
/// security adapter for `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityElement {
    /// Security kind identifier.
    pub kind: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Wire form of one content within an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentElement {
    /// Who proposed this content.
    pub creator: Creator,
    /// Content name, unique within its session.
    pub name: String,
    /// Senders policy. Absent means [`Senders::Both`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Senders>,
    /// Description layer, present on offers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<DescriptionElement>,
    /// Transport layer, present on offers and transport actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportElement>,
    /// Optional security layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityElement>,
}

impl ContentElement {
    /// An element that only names a content, for accept/reject/remove
    /// actions that do not renegotiate any layer.
    pub fn named(creator: Creator, name: impl Into<String>) -> Self {
        Self {
            creator,
            name: name.into(),
            senders: None,
            description: None,
            transport: None,
            security: None,
        }
    }

    /// An element naming a content and carrying a transport layer, for
    /// transport-accept/reject/replace/info actions.
    pub fn with_transport(creator: Creator, name: impl Into<String>, transport: TransportElement) -> Self {
        Self {
            transport: Some(transport),
            ..Self::named(creator, name)
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One signaling message, request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The session this message belongs to.
    pub session_id: String,
    /// What the sender wants done.
    pub action: Action,
    /// Identity of the session initiator, set on session-initiate/accept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<EndpointId>,
    /// Identity of the session responder, set on session-initiate/accept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<EndpointId>,
    /// Contents affected by this action.
    #[serde(default)]
    pub contents: Vec<ContentElement>,
    /// Termination reason; mandatory on session-terminate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl Envelope {
    fn bare(session_id: impl Into<String>, action: Action) -> Self {
        Self {
            session_id: session_id.into(),
            action,
            initiator: None,
            responder: None,
            contents: Vec::new(),
            reason: None,
        }
    }

    /// Builds a session-initiate enumerating the session's contents.
    pub fn session_initiate(
        initiator: EndpointId,
        responder: EndpointId,
        session_id: impl Into<String>,
        contents: Vec<ContentElement>,
    ) -> Self {
        Self {
            initiator: Some(initiator),
            responder: Some(responder),
            contents,
            ..Self::bare(session_id, Action::SessionInitiate)
        }
    }

    /// Builds a session-accept enumerating the responder's view of the
    /// contents (including its own transport offers).
    pub fn session_accept(
        initiator: EndpointId,
        responder: EndpointId,
        session_id: impl Into<String>,
        contents: Vec<ContentElement>,
    ) -> Self {
        Self {
            initiator: Some(initiator),
            responder: Some(responder),
            contents,
            ..Self::bare(session_id, Action::SessionAccept)
        }
    }

    /// Builds a session-terminate. The reason is mandatory by protocol.
    pub fn session_terminate(session_id: impl Into<String>, reason: Reason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::bare(session_id, Action::SessionTerminate)
        }
    }

    /// Builds a content-add proposing one new content.
    pub fn content_add(session_id: impl Into<String>, content: ContentElement) -> Self {
        Self {
            contents: vec![content],
            ..Self::bare(session_id, Action::ContentAdd)
        }
    }

    /// Builds a content-accept for previously proposed contents.
    pub fn content_accept(session_id: impl Into<String>, contents: Vec<ContentElement>) -> Self {
        Self {
            contents,
            ..Self::bare(session_id, Action::ContentAccept)
        }
    }

    /// Builds a content-reject for previously proposed contents.
    pub fn content_reject(session_id: impl Into<String>, contents: Vec<ContentElement>) -> Self {
        Self {
            contents,
            ..Self::bare(session_id, Action::ContentReject)
        }
    }

    /// Builds a content-remove for active contents.
    pub fn content_remove(session_id: impl Into<String>, contents: Vec<ContentElement>) -> Self {
        Self {
            contents,
            ..Self::bare(session_id, Action::ContentRemove)
        }
    }

    /// Builds a transport-replace proposing a new transport for a content.
    pub fn transport_replace(
        session_id: impl Into<String>,
        creator: Creator,
        name: impl Into<String>,
        transport: TransportElement,
    ) -> Self {
        Self {
            contents: vec![ContentElement::with_transport(creator, name, transport)],
            ..Self::bare(session_id, Action::TransportReplace)
        }
    }

    /// Builds a transport-accept confirming a proposed replacement.
    pub fn transport_accept(
        session_id: impl Into<String>,
        creator: Creator,
        name: impl Into<String>,
        transport: TransportElement,
    ) -> Self {
        Self {
            contents: vec![ContentElement::with_transport(creator, name, transport)],
            ..Self::bare(session_id, Action::TransportAccept)
        }
    }

    /// Builds a transport-reject refusing a proposed replacement.
    pub fn transport_reject(
        session_id: impl Into<String>,
        creator: Creator,
        name: impl Into<String>,
        transport: TransportElement,
    ) -> Self {
        Self {
            contents: vec![ContentElement::with_transport(creator, name, transport)],
            ..Self::bare(session_id, Action::TransportReject)
        }
    }

    /// Builds a transport-info carrying a candidate notification or an
    /// in-band data chunk.
    pub fn transport_info(
        session_id: impl Into<String>,
        creator: Creator,
        name: impl Into<String>,
        transport: TransportElement,
    ) -> Self {
        Self {
            contents: vec![ContentElement::with_transport(creator, name, transport)],
            ..Self::bare(session_id, Action::TransportInfo)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::candidate::Candidate;

    fn sample_transport() -> TransportElement {
        let mut candidates = CandidateSet::new();
        candidates.add(Candidate::direct("192.0.2.10", 7777));
        candidates.add(Candidate::proxy(
            "relay.example",
            7778,
            EndpointId::new("relay@example"),
        ));
        TransportElement {
            kind: TransportKind::socket(),
            stream_id: "stream-1".to_string(),
            candidates,
            info: None,
            block_size: None,
        }
    }

    fn sample_content(name: &str) -> ContentElement {
        ContentElement {
            creator: Creator::Initiator,
            name: name.to_string(),
            senders: Some(Senders::Both),
            description: Some(DescriptionElement {
                kind: "file".to_string(),
                payload: serde_json::json!({ "name": "photo.jpg", "size": 4096 }),
            }),
            transport: Some(sample_transport()),
            security: None,
        }
    }

    #[test]
    fn session_initiate_roundtrip_preserves_contents() {
        let env = Envelope::session_initiate(
            EndpointId::new("alice@example/a"),
            EndpointId::new("bob@example/b"),
            "session-1",
            vec![sample_content("a"), sample_content("b")],
        );

        let json = serde_json::to_string(&env).expect("serialize");
        let back: Envelope = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(back.action, Action::SessionInitiate);
        assert_eq!(back.session_id, "session-1");
        let names: Vec<&str> = back.contents.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        for (orig, parsed) in env.contents.iter().zip(back.contents.iter()) {
            assert_eq!(orig.creator, parsed.creator);
            assert_eq!(orig.senders, parsed.senders);
            assert_eq!(
                orig.transport.as_ref().map(|t| &t.kind),
                parsed.transport.as_ref().map(|t| &t.kind)
            );
        }
    }

    #[test]
    fn terminate_always_carries_a_reason() {
        let env = Envelope::session_terminate("session-1", Reason::FailedTransport);
        let json = serde_json::to_string(&env).expect("serialize");
        let back: Envelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.reason, Some(Reason::FailedTransport));
    }

    #[test]
    fn transport_info_roundtrip() {
        let info = TransportInfoElement::CandidateUsed {
            candidate_id: "cand-9".to_string(),
        };
        let env = Envelope::transport_info(
            "session-1",
            Creator::Responder,
            "a",
            TransportElement::info(TransportKind::socket(), "stream-1", info.clone()),
        );

        let json = serde_json::to_string(&env).expect("serialize");
        let back: Envelope = serde_json::from_str(&json).expect("deserialize");
        let transport = back.contents[0].transport.as_ref().expect("transport");
        assert_eq!(transport.info.as_ref(), Some(&info));
    }

    #[test]
    fn data_chunks_roundtrip_in_order_fields() {
        let info = TransportInfoElement::Data {
            seq: 3,
            payload: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let json = serde_json::to_string(&info).expect("serialize");
        let back: TransportInfoElement = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, info);
    }

    #[test]
    fn action_scoping() {
        assert!(Action::TransportReplace.is_content_scoped());
        assert!(Action::SessionInfo.is_content_scoped());
        assert!(!Action::ContentAccept.is_content_scoped());
        assert!(!Action::SessionTerminate.is_content_scoped());
    }
}
