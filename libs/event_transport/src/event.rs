use bytes::Bytes;
use std::fmt::Debug;
use std::time::SystemTime;

/// Minimal contract every event moved through the transport layer satisfies.
///
/// The buffering layer only ever moves events around; it never looks at the
/// payload.
pub trait Event: Send + Sync + Debug + 'static {
    /// Unique identifier of the event
    fn id(&self) -> &str;

    /// Type tag used by upstream layers for dispatch
    fn event_type(&self) -> &str;

    /// Creation time of the event
    fn timestamp(&self) -> SystemTime;
}

/// Protocol-agnostic event wrapper
#[derive(Debug, Clone)]
pub struct TransportEvent {
    id: String,
    event_type: String,
    timestamp: SystemTime,

    /// Opaque payload bytes (JSON, protobuf, etc.)
    pub payload: Bytes,
}

impl TransportEvent {
    /// Create a new event with a generated identifier
    pub fn new(event_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: SystemTime::now(),
            payload: payload.into(),
        }
    }

    /// Create a new event with a caller-provided identifier
    pub fn with_id(
        id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            timestamp: SystemTime::now(),
            payload: payload.into(),
        }
    }

    /// Override the creation timestamp
    pub fn at(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Get payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl Event for TransportEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}
