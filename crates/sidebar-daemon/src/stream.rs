//! Patch stream client.
//!
//! Holds one SSE connection open, resumes with `Last-Event-ID` after a drop
//! and reconnects with exponential backoff. Decoded frames are forwarded over
//! an mpsc channel; the task ends when the receiver is dropped.

use crate::config::ReconnectConfig;
use crate::sse::{SseEvent, SseParser};
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderValue};
use sidebar_core::StreamMessage;
use sidebar_core::wire::decode_stream_frame;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

/// Which server stream a frame came from. Each carries its own sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Sidebar,
    Preferences,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected(StreamSource),
    Message(StreamSource, StreamMessage),
    Disconnected(StreamSource),
}

/// Decode one SSE event into a stream message, logging what is dropped.
pub fn decode_event(source: StreamSource, event: &SseEvent) -> Option<StreamMessage> {
    match decode_stream_frame(Some(event.event.as_str()), &event.data) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping undecodable {:?} frame ({}): {}", source, event.event, e);
            None
        }
    }
}

pub struct PatchStream {
    client: Client,
    url: Url,
    source: StreamSource,
    reconnect: ReconnectConfig,
    last_event_id: Option<String>,
}

impl PatchStream {
    pub fn new(client: Client, url: Url, source: StreamSource, reconnect: ReconnectConfig) -> Self {
        Self {
            client,
            url,
            source,
            reconnect,
            last_event_id: None,
        }
    }

    /// Run until `tx` is closed.
    pub async fn run(mut self, tx: mpsc::Sender<StreamEvent>) {
        let mut attempt: u32 = 0;
        loop {
            match self.connect().await {
                Ok(response) => {
                    attempt = 0;
                    info!("{:?} stream connected to {}", self.source, self.url);
                    if tx.send(StreamEvent::Connected(self.source)).await.is_err() {
                        return;
                    }
                    if !self.pump(response, &tx).await {
                        return;
                    }
                    if tx.send(StreamEvent::Disconnected(self.source)).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("{:?} stream connect failed: {}", self.source, e),
            }

            if tx.is_closed() {
                return;
            }
            attempt = attempt.saturating_add(1);
            let delay = self.reconnect.backoff(attempt);
            debug!(
                "Reconnecting {:?} stream in {:?} (attempt {})",
                self.source, delay, attempt
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(&self) -> reqwest::Result<reqwest::Response> {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(id) = &self.last_event_id {
            request = request.header("Last-Event-ID", id.as_str());
        }
        request.send().await?.error_for_status()
    }

    /// Forward frames until the body ends. Returns `false` once the receiver
    /// is gone.
    async fn pump(&mut self, response: reqwest::Response, tx: &mpsc::Sender<StreamEvent>) -> bool {
        let mut parser = SseParser::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("{:?} stream read failed: {}", self.source, e);
                    break;
                }
            };
            for event in parser.feed(&bytes) {
                if !self.forward(event, tx).await {
                    return false;
                }
            }
        }
        if parser.discard_pending() {
            debug!("{:?} stream dropped an incomplete event", self.source);
        }
        info!("{:?} stream ended", self.source);
        true
    }

    /// The resume id only advances past frames that decoded, so the server
    /// replays anything that was lost.
    async fn forward(&mut self, event: SseEvent, tx: &mpsc::Sender<StreamEvent>) -> bool {
        let message = match decode_stream_frame(Some(event.event.as_str()), &event.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Dropping undecodable {:?} frame ({}): {}",
                    self.source, event.event, e
                );
                return true;
            }
        };
        if let Some(id) = event.id.filter(|id| !id.is_empty()) {
            self.last_event_id = Some(id);
        }
        match message {
            Some(message) => tx
                .send(StreamEvent::Message(self.source, message))
                .await
                .is_ok(),
            None => true,
        }
    }
}
