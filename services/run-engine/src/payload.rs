//! Conditional payload export.
//!
//! Callers hand over raw bytes plus a type tag. Anything at or below the
//! inline threshold is kept inline; larger payloads are written to the object
//! store and replaced by a reference. The decision is made once, here, and
//! the resulting [`PayloadPacket`] is opaque to the rest of the engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::PayloadPacket;

/// Default inline threshold (128 KiB).
pub const DEFAULT_INLINE_THRESHOLD: usize = 128 * 1024;

/// Errors raised by the export collaborator.
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    #[error("object store write failed for {key}: {message}")]
    Store { key: String, message: String },

    #[error("payload could not be serialized: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Serialization(err.to_string())
    }
}

/// Raw payload as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IoPacket {
    pub data: Option<Bytes>,
    pub data_type: String,
}

impl IoPacket {
    pub fn new(data: impl Into<Bytes>, data_type: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            data_type: data_type.into(),
        }
    }

    /// Serializes an optional JSON value; `None` yields an empty packet.
    pub fn from_json(value: Option<&serde_json::Value>) -> Result<Self, ExportError> {
        let data = match value {
            Some(value) => Some(Bytes::from(serde_json::to_vec(value)?)),
            None => None,
        };
        Ok(Self {
            data,
            data_type: "application/json".to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Blob storage for offloaded payloads.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), ExportError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, ExportError>;
}

/// Export capability consumed by `trigger` and waitpoint completion.
#[async_trait]
pub trait PayloadExporter: Send + Sync {
    /// Returns `None` when the packet carries no data.
    async fn export(&self, packet: IoPacket, key: &str)
        -> Result<Option<PayloadPacket>, ExportError>;
}

/// Keeps small payloads inline and offloads the rest to an [`ObjectStore`].
pub struct ConditionalExporter {
    store: Arc<dyn ObjectStore>,
    threshold: usize,
}

impl ConditionalExporter {
    pub fn new(store: Arc<dyn ObjectStore>, threshold: usize) -> Self {
        Self { store, threshold }
    }
}

#[async_trait]
impl PayloadExporter for ConditionalExporter {
    async fn export(
        &self,
        packet: IoPacket,
        key: &str,
    ) -> Result<Option<PayloadPacket>, ExportError> {
        let Some(data) = packet.data else {
            return Ok(None);
        };

        if data.len() <= self.threshold {
            return Ok(Some(PayloadPacket::Inline {
                data,
                data_type: packet.data_type,
            }));
        }

        let storage_key = format!("{key}.{}", extension_for(&packet.data_type));
        debug!(
            storage_key = %storage_key,
            size = data.len(),
            "Offloading payload to object store"
        );
        self.store
            .put(&storage_key, data, &packet.data_type)
            .await?;

        Ok(Some(PayloadPacket::Reference {
            storage_key,
            data_type: packet.data_type,
        }))
    }
}

fn extension_for(data_type: &str) -> &'static str {
    match data_type {
        "application/json" | "application/super+json" => "json",
        "text/plain" => "txt",
        _ => "bin",
    }
}

/// Process-local object store for tests and single-node development.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> Result<(), ExportError> {
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, ExportError> {
        Ok(self.objects.read().await.get(key).cloned())
    }
}
