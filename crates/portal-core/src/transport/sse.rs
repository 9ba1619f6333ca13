//! HTTP+SSE carrier.
//!
//! Inbound frames arrive as `data:` payloads on a server-sent-events stream;
//! outbound frames are POSTed as JSON to the same URL. Missed events while
//! disconnected are not replayed.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::warn;

use super::Carrier;
use crate::protocol::Frame;
use crate::{PortalError, PortalResult};

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

/// Carrier over an SSE stream plus POST-back channel.
pub struct SseCarrier {
    server_name: String,
    url: String,
    client: reqwest::Client,
    stream: Option<ByteStream>,
    /// Unprocessed bytes from the stream, split at line boundaries.
    pending: String,
    /// `data:` lines of the event currently being assembled.
    data_lines: Vec<String>,
}

impl SseCarrier {
    /// Open the SSE stream.
    pub async fn connect(server_name: &str, url: &str, timeout: Duration) -> PortalResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| PortalError::Transport(format!("build client: {e}")))?;

        let response = client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| PortalError::Transport(format!("open SSE stream: {e}")))?
            .error_for_status()
            .map_err(|e| PortalError::Transport(format!("SSE stream rejected: {e}")))?;

        Ok(Self {
            server_name: server_name.to_string(),
            url: url.to_string(),
            client,
            stream: Some(Box::pin(response.bytes_stream())),
            pending: String::new(),
            data_lines: Vec::new(),
        })
    }

    /// Consume one line from the SSE stream, returning a complete event
    /// payload when a blank separator line is reached.
    fn take_line(&mut self) -> Option<String> {
        let newline = self.pending.find('\n')?;
        let line: String = self.pending.drain(..=newline).collect();
        Some(line.trim_end_matches(['\n', '\r']).to_string())
    }

    /// Feed one SSE line into the event assembler.
    fn accept_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data_lines.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.data_lines).join("\n"));
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(data.trim_start().to_string());
        }
        // `event:`, `id:`, `retry:` and comment lines are ignored.
        None
    }
}

#[async_trait]
impl Carrier for SseCarrier {
    async fn send(&mut self, frame: Frame) -> PortalResult<()> {
        self.client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&frame.to_json())
            .send()
            .await
            .map_err(|e| PortalError::Transport(format!("POST frame: {e}")))?
            .error_for_status()
            .map_err(|e| PortalError::Transport(format!("POST rejected: {e}")))?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<PortalResult<Frame>> {
        loop {
            while let Some(line) = self.take_line() {
                if let Some(payload) = self.accept_line(&line) {
                    return Some(Frame::from_line(&payload).map_err(|reason| {
                        warn!(server = %self.server_name, %reason, "malformed SSE frame");
                        PortalError::Transport(reason)
                    }));
                }
            }

            let stream = self.stream.as_mut()?;
            match stream.next().await {
                Some(Ok(chunk)) => {
                    self.pending.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(e)) => {
                    return Some(Err(PortalError::Transport(format!("SSE read: {e}"))));
                }
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        self.stream.take();
        self.pending.clear();
        self.data_lines.clear();
    }
}
