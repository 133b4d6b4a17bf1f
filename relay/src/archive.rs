//! Request/response archival

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Object storage for archived exchanges
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store `body` under `key`
    async fn put(&self, key: &str, body: Bytes) -> Result<()>;
}

/// Archive kept in memory
#[derive(Debug, Default)]
pub struct MemoryArchive {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryArchive {
    /// Empty archive
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored object
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).cloned()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchive {
    async fn put(&self, key: &str, body: Bytes) -> Result<()> {
        self.objects.lock().insert(key.to_string(), body);
        Ok(())
    }
}

/// Uploads successful exchanges keyed by request id
#[derive(Clone)]
pub struct RequestArchiver {
    store: Arc<dyn ArchiveStore>,
}

impl std::fmt::Debug for RequestArchiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestArchiver").finish_non_exhaustive()
    }
}

fn body_value(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

impl RequestArchiver {
    /// Archiver over a store
    pub fn new(store: Arc<dyn ArchiveStore>) -> Self {
        Self { store }
    }

    /// Archive document; non-JSON bodies are kept as strings
    pub fn document(request_id: &str, request: &[u8], response: &[u8]) -> Value {
        json!({
            "request_id": request_id,
            "requestBody": body_value(request),
            "responseBody": body_value(response),
        })
    }

    /// Build and upload the document
    pub async fn archive(&self, request_id: &str, request: &[u8], response: &[u8]) -> Result<()> {
        let document = Self::document(request_id, request, response);
        let bytes = serde_json::to_vec(&document)
            .map_err(|e| Error::Archive(format!("serialize {}: {}", request_id, e)))?;
        self.store.put(request_id, Bytes::from(bytes)).await?;
        debug!(request_id, "exchange archived");
        Ok(())
    }
}
