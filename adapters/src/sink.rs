//! Response sinks
//!
//! The relay hands every adaptor a sink to write the client-facing body
//! into. [`BufferSink`] collects it for the buffered entry point;
//! [`ChannelSink`] forwards chunks over an mpsc channel as they arrive.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// Destination for the converted response body
#[async_trait]
pub trait ResponseSink: Send {
    /// Record the response content type (before the first write)
    fn set_content_type(&mut self, content_type: &str);

    /// Write one chunk
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Whether any byte has reached the client
    fn committed(&self) -> bool;

    /// Drop uncommitted output left by a failed attempt
    fn reset(&mut self) {}
}

/// Collects the whole body in memory
#[derive(Debug, Default)]
pub struct BufferSink {
    content_type: Option<String>,
    buf: BytesMut,
}

impl BufferSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Content type set by the adaptor
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing was written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop everything written (a failed attempt's partial body)
    pub fn clear(&mut self) {
        self.buf.clear();
        self.content_type = None;
    }

    /// Take the body
    pub fn into_parts(self) -> (Option<String>, Bytes) {
        (self.content_type, self.buf.freeze())
    }
}

#[async_trait]
impl ResponseSink for BufferSink {
    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_string());
    }

    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    // Nothing reaches the client until the relay returns.
    fn committed(&self) -> bool {
        false
    }

    fn reset(&mut self) {
        self.clear();
    }
}

/// Streams chunks to the client as they are written
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
    content_type: Option<String>,
    written: usize,
}

impl ChannelSink {
    /// Sink over an mpsc sender
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            content_type: None,
            written: 0,
        }
    }

    /// Content type set by the adaptor
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Bytes forwarded so far
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// Underlying sender
    pub fn sender(&self) -> &mpsc::Sender<Bytes> {
        &self.tx
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_string());
    }

    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len();
        self.tx.send(chunk).await.map_err(|_| Error::ClientGone)?;
        self.written += len;
        Ok(())
    }

    fn committed(&self) -> bool {
        self.written > 0
    }
}
