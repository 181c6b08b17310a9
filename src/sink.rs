//! Client channel
//!
//! The driver writes encoded frames to an `EnvelopeSink`. A closed channel
//! reports `ClientDisconnected`.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::envelope::{OutputEnvelope, decode_frame, encode_frame, encode_frame_bytes};
use crate::error::{Result, StreamError};

/// Destination of one run's frames.
#[async_trait]
pub trait EnvelopeSink: Send {
    /// Encode and write one envelope.
    async fn send(&mut self, envelope: &OutputEnvelope) -> Result<()>;

    /// Push written frames towards the client and yield to other tasks.
    async fn flush(&mut self) -> Result<()> {
        tokio::task::yield_now().await;
        Ok(())
    }
}

/// Sink writing frames into a bounded byte channel, typically drained by an
/// HTTP response body.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    /// Wrap an existing sender.
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver feeding the client.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EnvelopeSink for ChannelSink {
    async fn send(&mut self, envelope: &OutputEnvelope) -> Result<()> {
        let frame = encode_frame_bytes(envelope)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| StreamError::ClientDisconnected)
    }
}

/// Sink collecting frames in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    frames: Vec<String>,
    accept_limit: Option<usize>,
    flushes: usize,
}

impl MemorySink {
    /// Unbounded in-memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that behaves like a client disconnecting after `n` frames.
    pub fn disconnect_after(n: usize) -> Self {
        Self {
            accept_limit: Some(n),
            ..Self::default()
        }
    }

    /// Raw frames, in write order.
    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    /// Frames decoded back into envelopes.
    pub fn envelopes(&self) -> Result<Vec<OutputEnvelope>> {
        self.frames.iter().map(|f| decode_frame(f)).collect()
    }

    /// Number of flushes requested.
    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

#[async_trait]
impl EnvelopeSink for MemorySink {
    async fn send(&mut self, envelope: &OutputEnvelope) -> Result<()> {
        if self.accept_limit.is_some_and(|limit| self.frames.len() >= limit) {
            return Err(StreamError::ClientDisconnected);
        }
        self.frames.push(encode_frame(envelope)?);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
