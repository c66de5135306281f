//! Optional end-to-end protection of a content's byte-stream.
//!
//! The engine defines where protection hooks in, not how it is done: a
//! [`Security`] implementation wraps the established stream before the
//! description layer ever sees it. No cipher ships with the engine; the
//! surrounding application registers a [`SecurityAdapter`] per kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::EngineError;
use crate::signaling::channel::ByteStream;
use crate::signaling::message::SecurityElement;

/// The protection layer of a content.
#[async_trait]
pub trait Security: Send + Sync {
    /// Kind identifier, matching the adapter this layer registers under.
    fn kind(&self) -> String;

    /// The wire element advertising this layer.
    fn element(&self) -> SecurityElement;

    /// Wraps the stream for the sending side. Handshakes run here; failure
    /// fails the transfer without tearing the session down.
    async fn protect_outgoing(&self, stream: ByteStream) -> Result<ByteStream, EngineError>;

    /// Wraps the stream for the receiving side.
    async fn protect_incoming(&self, stream: ByteStream) -> Result<ByteStream, EngineError>;
}

/// Reconstructs security layers of one kind from incoming offers.
pub trait SecurityAdapter: Send + Sync {
    /// The kind this adapter understands.
    fn kind(&self) -> String;

    /// Builds a security layer from a peer's wire element.
    fn from_element(&self, element: &SecurityElement) -> Result<Arc<dyn Security>, EngineError>;
}

/// Security adapters known to this engine, keyed by kind.
#[derive(Default)]
pub struct SecurityRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn SecurityAdapter>>>,
}

impl SecurityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, replacing any previous one of the same kind.
    pub fn register(&self, adapter: Arc<dyn SecurityAdapter>) {
        self.adapters.write().insert(adapter.kind(), adapter);
    }

    /// Builds a security layer from a peer's offer, or reports the kind as
    /// unsupported.
    pub fn resolve(&self, element: &SecurityElement) -> Result<Arc<dyn Security>, EngineError> {
        let adapter = self
            .adapters
            .read()
            .get(&element.kind)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedSecurity(element.kind.clone()))?;
        adapter.from_element(element)
    }
}
