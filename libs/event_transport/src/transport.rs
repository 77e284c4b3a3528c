use crate::event::Event;
use crate::ring_buffer::EventReceiver;
use crate::{Result, TransportError};
use async_trait::async_trait;
use std::fmt::Debug;

/// A pluggable network transport (WebSocket, HTTP, gRPC, ...)
///
/// Implementations own framing and I/O. The manager only relies on the
/// lifecycle calls below and on the two inbound channels.
#[async_trait]
pub trait Transport<E: Event>: Send + Sync + Debug {
    /// Establish the connection
    async fn connect(&self) -> Result<()>;

    /// Send a single event
    async fn send(&self, event: E) -> Result<()>;

    /// Close the connection (no-op if not connected)
    async fn close(&self) -> Result<()>;

    /// Inbound events. The receiver yields `None` once the transport is done.
    fn receive(&self) -> EventReceiver<E>;

    /// Asynchronous errors reported by the transport
    fn errors(&self) -> EventReceiver<TransportError>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Human-readable name used in logs and error context
    fn name(&self) -> &str {
        "transport"
    }

    /// Send several events in order, stopping at the first failure.
    /// Returns how many were sent.
    async fn send_batch(&self, events: Vec<E>) -> Result<usize> {
        let mut sent = 0;
        for event in events {
            self.send(event).await?;
            sent += 1;
        }
        Ok(sent)
    }
}
