// Copyright (c) 2026 Parley Contributors. MIT License.
// See LICENSE for details.

//! # Parley: Core Negotiation Engine
//!
//! Parley negotiates peer-to-peer sessions the way they actually happen:
//! over a signaling channel that works, towards sockets that mostly don't.
//! Two endpoints agree on *what* to exchange (contents), *how* the bytes
//! should flow (transports) and whether the bytes are protected (security),
//! then race connection candidates until something sticks, falling back to
//! tunneling through the signaling channel itself when nothing does.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the layers of a negotiation:
//!
//! - **engine**: the public surface. Session registry, API, event stream.
//! - **session**: the session state machine. Monotonic; `Ended` is forever.
//! - **content**: per-content lifecycle flags, transport replacement and
//!   the tie-break rules for when both sides get clever simultaneously.
//! - **transport**: transport traits, the ranked kind registry, candidate
//!   racing over sockets and the in-band fallback of last resort.
//! - **description**: what rides the stream. Ships with file transfer.
//! - **security**: where end-to-end protection hooks in. Bring your own
//!   cipher; the engine only promises to call it at the right moment.
//! - **signaling**: the typed wire model and the capabilities the engine
//!   borrows from its host (channel, connector, relay discovery).
//! - **config**: protocol constants. Every magic number, one place.
//!
//! ## Design Philosophy
//!
//! 1. The engine owns negotiation state, never I/O policy; listeners,
//!    ciphers and addressing belong to the host application.
//! 2. Synchronous acknowledgment, asynchronous consequence: incoming
//!    actions are answered immediately, side effects run in the background.
//! 3. Failure is a first-class outcome. Exactly one report per transport,
//!    with enough detail to tell exhaustion from sabotage.

pub mod config;
pub mod content;
pub mod description;
pub mod engine;
pub mod error;
pub mod security;
pub mod session;
pub mod signaling;
pub mod transport;

pub use content::{Content, ContentFlag};
pub use description::{Description, DescriptionAdapter, FileDescription, FileMetadata};
pub use engine::{ContentSpec, Engine, EngineConfig, EngineCore, EngineEvent};
pub use error::{EngineError, TransferFailure};
pub use security::{Security, SecurityAdapter};
pub use session::{Role, Session, SessionState};
pub use signaling::channel::{
    ByteStream, RelayDiscovery, RelayHost, SignalingChannel, SignalingError, SocketConnector,
    TcpConnector,
};
pub use signaling::message::{
    Action, ActionResponse, ContentElement, Creator, EndpointId, Envelope, Reason, Senders,
};
pub use transport::{Direction, Transport, TransportKind, TransportManager};
