//! Content descriptions: what a negotiated byte-stream carries.
//!
//! The engine treats descriptions as pluggable components behind the
//! [`Description`] trait. A [`DescriptionAdapter`] reconstructs a
//! description from its wire element when a peer offers one; adapters live
//! in the [`DescriptionRegistry`], keyed by kind. One concrete
//! implementation ships here: [`FileDescription`], the file-transfer
//! description.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::EngineEvent;
use crate::error::EngineError;
use crate::signaling::channel::ByteStream;
use crate::signaling::message::DescriptionElement;
use crate::transport::{Direction, NegotiationCtx};

// ---------------------------------------------------------------------------
// Component Trait
// ---------------------------------------------------------------------------

/// The application layer of a content.
#[async_trait]
pub trait Description: Send + Sync {
    /// Kind identifier, matching the adapter this description registers
    /// under.
    fn kind(&self) -> String;

    /// The wire element advertising this description.
    fn element(&self) -> DescriptionElement;

    /// Called once the content's byte-stream is established (and, where a
    /// security layer exists, protected).
    async fn on_stream_ready(&self, direction: Direction, stream: ByteStream, ctx: NegotiationCtx);
}

/// Reconstructs descriptions of one kind from incoming offers.
pub trait DescriptionAdapter: Send + Sync {
    /// The kind this adapter understands.
    fn kind(&self) -> String;

    /// Builds a description from a peer's wire element.
    fn from_element(&self, element: &DescriptionElement) -> Result<Arc<dyn Description>, EngineError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Description adapters known to this engine, keyed by kind.
#[derive(Default)]
pub struct DescriptionRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn DescriptionAdapter>>>,
}

impl DescriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, replacing any previous one of the same kind.
    pub fn register(&self, adapter: Arc<dyn DescriptionAdapter>) {
        self.adapters.write().insert(adapter.kind(), adapter);
    }

    /// Builds a description from a peer's offer, or reports the kind as
    /// unsupported.
    pub fn resolve(&self, element: &DescriptionElement) -> Result<Arc<dyn Description>, EngineError> {
        let adapter = self
            .adapters
            .read()
            .get(&element.kind)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedDescription(element.kind.clone()))?;
        adapter.from_element(element)
    }

    /// Whether a kind has a registered adapter.
    pub fn supports(&self, kind: &str) -> bool {
        self.adapters.read().contains_key(kind)
    }
}

// ---------------------------------------------------------------------------
// File Transfer
// ---------------------------------------------------------------------------

/// Metadata of an offered file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File name as offered, never interpreted as a path.
    pub name: String,
    /// Size in bytes, when known at offer time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Media type of the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Hash of the payload, as `algorithm:hex`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// File-transfer description. Hands the ready stream to the owner through a
/// [`EngineEvent::StreamReady`] event; the owner reads or writes the file
/// bytes itself.
pub struct FileDescription {
    metadata: FileMetadata,
}

impl FileDescription {
    /// Kind identifier of file-transfer descriptions.
    pub const KIND: &'static str = "file";

    /// Creates a description offering `metadata`.
    pub fn new(metadata: FileMetadata) -> Self {
        Self { metadata }
    }

    /// The offered file metadata.
    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }
}

#[async_trait]
impl Description for FileDescription {
    fn kind(&self) -> String {
        Self::KIND.to_string()
    }

    fn element(&self) -> DescriptionElement {
        let payload = serde_json::to_value(&self.metadata).unwrap_or(serde_json::Value::Null);
        DescriptionElement {
            kind: Self::KIND.to_string(),
            payload,
        }
    }

    async fn on_stream_ready(&self, direction: Direction, stream: ByteStream, ctx: NegotiationCtx) {
        ctx.core.emit(EngineEvent::StreamReady {
            session_id: ctx.session.id().to_string(),
            content_name: ctx.content.name().to_string(),
            direction,
            stream,
        });
    }
}

/// Adapter for [`FileDescription`], registered by default.
#[derive(Default)]
pub struct FileDescriptionAdapter;

impl DescriptionAdapter for FileDescriptionAdapter {
    fn kind(&self) -> String {
        FileDescription::KIND.to_string()
    }

    fn from_element(&self, element: &DescriptionElement) -> Result<Arc<dyn Description>, EngineError> {
        let metadata: FileMetadata =
            serde_json::from_value(element.payload.clone()).map_err(|error| {
                warn!(%error, "malformed file description payload");
                EngineError::ProtocolViolation(format!("malformed file description: {error}"))
            })?;
        Ok(Arc::new(FileDescription::new(metadata)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> FileMetadata {
        FileMetadata {
            name: "photo.jpg".to_string(),
            size: Some(48_213),
            media_type: Some("image/jpeg".to_string()),
            hash: Some("sha-256:deadbeef".to_string()),
        }
    }

    #[test]
    fn file_description_roundtrips_through_its_element() {
        let description = FileDescription::new(sample_metadata());
        let element = description.element();
        assert_eq!(element.kind, FileDescription::KIND);

        let registry = DescriptionRegistry::new();
        registry.register(Arc::new(FileDescriptionAdapter));
        let rebuilt = registry.resolve(&element).expect("resolve");
        assert_eq!(rebuilt.kind(), FileDescription::KIND);
        assert_eq!(rebuilt.element(), element);
    }

    #[test]
    fn unknown_kinds_are_unsupported() {
        let registry = DescriptionRegistry::new();
        let element = DescriptionElement {
            kind: "screenshare".to_string(),
            payload: serde_json::Value::Null,
        };
        assert!(matches!(
            registry.resolve(&element),
            Err(EngineError::UnsupportedDescription(kind)) if kind == "screenshare"
        ));
        assert!(!registry.supports("screenshare"));
    }

    #[test]
    fn malformed_file_payload_is_a_violation() {
        let adapter = FileDescriptionAdapter;
        let element = DescriptionElement {
            kind: FileDescription::KIND.to_string(),
            payload: serde_json::json!({ "size": "not-a-number" }),
        };
        assert!(matches!(
            adapter.from_element(&element),
            Err(EngineError::ProtocolViolation(_))
        ));
    }
}
