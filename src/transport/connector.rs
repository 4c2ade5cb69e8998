use std::sync::Arc;
use tokio::sync::mpsc;

use super::events::TransportEvent;
use crate::error::Result;
use crate::session::SessionConfig;

/// Outcome of handing a frame to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Queued for transmission
    Sent,
    /// Discarded because the outbound queue was full
    Dropped,
}

/// Outbound half of a duplex session
#[async_trait::async_trait]
pub trait LiveTransport: Send + Sync {
    /// Queue one encoded PCM frame
    ///
    /// Fails with `LiveError::NotConnected` before the session has opened
    /// or after it closed; nothing is transmitted in that case.
    fn send(&self, frame: Vec<u8>) -> Result<SendStatus>;

    fn is_open(&self) -> bool;

    /// Close the session. Idempotent.
    async fn close(&self);
}

/// Opens duplex sessions to a remote inference endpoint
///
/// The returned receiver carries the session's events in delivery order.
#[async_trait::async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(
        &self,
        config: &SessionConfig,
    ) -> Result<(Arc<dyn LiveTransport>, mpsc::Receiver<TransportEvent>)>;
}
