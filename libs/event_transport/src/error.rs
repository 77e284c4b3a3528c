use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Context information for send operations to aid in debugging
#[derive(Debug, Clone)]
pub struct SendContext {
    /// Identifier of the event being sent
    pub event_id: String,
    /// Type tag of the event being sent
    pub event_type: String,
    /// Timestamp when send was attempted (nanoseconds since epoch)
    pub timestamp_ns: u64,
    /// Transport the send was routed to, if known
    pub target: Option<String>,
}

impl SendContext {
    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            timestamp_ns: now_ns(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Transport already connected")]
    AlreadyConnected,

    #[error("Backpressure active, buffer full")]
    BackpressureActive,

    #[error("Backpressure timeout exceeded after {timeout_ms}ms")]
    BackpressureTimeout { timeout_ms: u64 },

    #[error("Buffer closed")]
    BufferClosed,

    #[error("Buffer empty")]
    BufferEmpty,

    #[error("Buffer full")]
    BufferFull,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cleanup task already registered: {0}")]
    DuplicateTask(String),

    #[error("Cleanup task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Send failed: {error} (event: {event_id}, type: {event_type}, target: {target:?})",
            event_id = context.event_id,
            event_type = context.event_type,
            target = context.target)]
    SendFailed { error: String, context: SendContext },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Callback panicked in {location}: {message}")]
    CallbackPanicked { location: String, message: String },

    #[error("Closed")]
    Closed,

    #[error("Other error: {0}")]
    Other(String),
}

// SendContext carries a timestamp, so equality only looks at the identifying fields.
impl PartialEq for SendContext {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
            && self.event_type == other.event_type
            && self.target == other.target
    }
}

impl Eq for SendContext {}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost(_)
                | TransportError::Timeout { .. }
                | TransportError::BackpressureActive
                | TransportError::BackpressureTimeout { .. }
                | TransportError::BufferFull
        )
    }

    /// Check if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_)
                | TransportError::ConnectionLost(_)
                | TransportError::NotConnected
        )
    }

    /// Conditions callers are expected to treat as a no-op rather than a failure
    pub fn is_benign(&self) -> bool {
        matches!(self, TransportError::AlreadyConnected)
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        TransportError::ConnectionFailed(msg.into())
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        TransportError::ConnectionLost(msg.into())
    }

    pub fn send_failed_with_context(msg: impl Into<String>, context: SendContext) -> Self {
        TransportError::SendFailed {
            error: msg.into(),
            context,
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        TransportError::InvalidConfig(msg.into())
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        TransportError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn backpressure_timeout(timeout: Duration) -> Self {
        TransportError::BackpressureTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Build an error from a recovered panic payload
    pub fn callback_panicked(
        location: impl Into<String>,
        payload: Box<dyn std::any::Any + Send>,
    ) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TransportError::CallbackPanicked {
            location: location.into(),
            message,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Other(err.to_string())
    }
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TransportError::AlreadyConnected.is_benign());
        assert!(!TransportError::NotConnected.is_benign());
        assert!(TransportError::NotConnected.is_connection_error());
        assert!(TransportError::backpressure_timeout(Duration::from_millis(5)).is_recoverable());
        assert!(!TransportError::DuplicateTask("x".into()).is_recoverable());
    }

    #[test]
    fn test_panic_payload_conversion() {
        let err = TransportError::callback_panicked("sweep", Box::new("boom"));
        assert_eq!(
            err,
            TransportError::CallbackPanicked {
                location: "sweep".into(),
                message: "boom".into()
            }
        );

        let err = TransportError::callback_panicked("sweep", Box::new(String::from("owned")));
        assert!(err.to_string().contains("owned"));
    }

    #[test]
    fn test_send_failed_display() {
        let ctx = SendContext::new("evt-1", "data").with_target("mock");
        let err = TransportError::send_failed_with_context("socket closed", ctx);
        let text = err.to_string();
        assert!(text.contains("socket closed"));
        assert!(text.contains("evt-1"));
        assert!(text.contains("mock"));
    }
}
