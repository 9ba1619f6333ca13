//! Session transports.
//!
//! Two interchangeable carriers move MCP frames to and from one upstream:
//! child-process stdio with newline-delimited JSON, and HTTP+SSE. A session
//! owns exactly one carrier and drives it from a single I/O loop.

pub mod sse;
pub mod stdio;

use async_trait::async_trait;

use crate::protocol::Frame;
use crate::PortalResult;

pub use sse::SseCarrier;
pub use stdio::StdioCarrier;

/// Common carrier contract.
#[async_trait]
pub trait Carrier: Send {
    /// Hand one frame to the OS buffer. Best-effort fire-and-forget.
    async fn send(&mut self, frame: Frame) -> PortalResult<()>;

    /// Next inbound frame.
    ///
    /// `None` marks the end of the stream (EOF or close). `Some(Err(_))`
    /// reports a malformed inbound frame; per the boundary rules the caller
    /// force-closes the carrier rather than retrying.
    async fn recv(&mut self) -> Option<PortalResult<Frame>>;

    /// Release all OS resources. Idempotent.
    async fn close(&mut self);
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory carrier for session tests.

    use super::*;
    use tokio::sync::mpsc;

    /// Carrier backed by channels: sends are captured, receives are scripted.
    pub struct MockCarrier {
        pub outbound: mpsc::UnboundedSender<Frame>,
        pub inbound: mpsc::UnboundedReceiver<PortalResult<Frame>>,
        closed: bool,
    }

    /// Test-side handles to drive a [`MockCarrier`].
    pub struct MockRemote {
        /// Frames the session sent.
        pub sent: mpsc::UnboundedReceiver<Frame>,
        /// Push frames for the session to receive.
        pub push: mpsc::UnboundedSender<PortalResult<Frame>>,
    }

    impl MockCarrier {
        pub fn pair() -> (MockCarrier, MockRemote) {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            (
                MockCarrier {
                    outbound: out_tx,
                    inbound: in_rx,
                    closed: false,
                },
                MockRemote {
                    sent: out_rx,
                    push: in_tx,
                },
            )
        }
    }

    #[async_trait]
    impl Carrier for MockCarrier {
        async fn send(&mut self, frame: Frame) -> PortalResult<()> {
            self.outbound
                .send(frame)
                .map_err(|_| crate::PortalError::Transport("mock peer gone".into()))
        }

        async fn recv(&mut self) -> Option<PortalResult<Frame>> {
            if self.closed {
                return None;
            }
            self.inbound.recv().await
        }

        async fn close(&mut self) {
            self.closed = true;
            self.inbound.close();
        }
    }
}
