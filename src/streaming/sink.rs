//! Destinations for outbound events.

use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::sse::{Dialect, SseEncoder};
use crate::error::{ProxyError, Result};
use crate::models::claude::StreamEvent;

/// Body chunk type handed to the HTTP layer
pub type BodyChunk = std::result::Result<Bytes, std::io::Error>;

/// Receives validated outbound events in order.
///
/// Each `send` is a flush boundary: implementations must not hold an event
/// back waiting for the next one.
pub trait EventSink: Send {
    fn send(&mut self, event: &StreamEvent) -> impl Future<Output = Result<()>> + Send;
}

/// Encodes events as SSE frames onto a response body channel
pub struct SseSink {
    tx: mpsc::Sender<BodyChunk>,
    encoder: SseEncoder,
    frames: usize,
}

impl SseSink {
    pub fn new(tx: mpsc::Sender<BodyChunk>, dialect: Dialect) -> Self {
        Self {
            tx,
            encoder: SseEncoder::new(dialect),
            frames: 0,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

impl EventSink for SseSink {
    async fn send(&mut self, event: &StreamEvent) -> Result<()> {
        let Some(frame) = self.encoder.encode(event) else {
            return Ok(());
        };
        self.tx
            .send(Ok(Bytes::from(frame)))
            .await
            .map_err(|_| ProxyError::TransportError("client disconnected".to_string()))?;
        self.frames += 1;
        Ok(())
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<StreamEvent>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.iter().map(StreamEvent::event_name).collect()
    }
}

impl EventSink for CollectingSink {
    async fn send(&mut self, event: &StreamEvent) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }
}
