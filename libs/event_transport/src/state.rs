use std::time::{Duration, Instant};

/// Lifecycle of a [`TransportManager`](crate::manager::TransportManager)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ManagerState {
    /// Created, never started
    #[default]
    Idle,
    /// `start()` in progress
    Starting,
    /// Transport connected and pumping events
    Running,
    /// `stop()` in progress
    Stopping,
    /// Stopped for good
    Stopped,
    /// Unrecoverable transport failure; `start()` may retry
    Error,
}

impl ManagerState {
    /// Check if events can flow
    pub fn is_running(&self) -> bool {
        matches!(self, ManagerState::Running)
    }

    /// Check if `start()` may attempt a connection from here
    pub fn can_start(&self) -> bool {
        matches!(self, ManagerState::Idle | ManagerState::Error)
    }

    /// Check if a lifecycle transition is in progress
    pub fn is_transitioning(&self) -> bool {
        matches!(self, ManagerState::Starting | ManagerState::Stopping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ManagerState::Stopped)
    }
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ManagerState::Idle => "idle",
            ManagerState::Starting => "starting",
            ManagerState::Running => "running",
            ManagerState::Stopping => "stopping",
            ManagerState::Stopped => "stopped",
            ManagerState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Connection status as seen by application code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// A replacement transport is being connected
    Reconnecting,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    /// Check if connection is active
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if connection is in progress
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    pub fn from_manager(state: ManagerState, swapping: bool) -> Self {
        match state {
            ManagerState::Running if swapping => ConnectionState::Reconnecting,
            ManagerState::Idle => ConnectionState::Disconnected,
            ManagerState::Starting => ConnectionState::Connecting,
            ManagerState::Running => ConnectionState::Connected,
            ManagerState::Stopping => ConnectionState::Closing,
            ManagerState::Stopped => ConnectionState::Closed,
            ManagerState::Error => ConnectionState::Error,
        }
    }
}

impl From<ManagerState> for ConnectionState {
    fn from(state: ManagerState) -> Self {
        ConnectionState::from_manager(state, false)
    }
}

/// Current lifecycle state plus when it was entered
#[derive(Debug, Clone)]
pub(crate) struct LifecycleState {
    state: ManagerState,
    entered_at: Instant,
    running_since: Option<Instant>,
}

impl LifecycleState {
    pub(crate) fn new() -> Self {
        Self {
            state: ManagerState::Idle,
            entered_at: Instant::now(),
            running_since: None,
        }
    }

    pub(crate) fn get(&self) -> ManagerState {
        self.state
    }

    pub(crate) fn running_since(&self) -> Option<Instant> {
        self.running_since
    }

    pub(crate) fn time_in_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    pub(crate) fn transition_to(&mut self, new_state: ManagerState) {
        if self.state == new_state {
            return;
        }
        tracing::debug!(
            "Transport manager state transition: {} -> {}",
            self.state,
            new_state
        );
        self.state = new_state;
        self.entered_at = Instant::now();

        if new_state == ManagerState::Running {
            self.running_since = Some(self.entered_at);
        } else if !new_state.is_transitioning() {
            self.running_since = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            ConnectionState::from(ManagerState::Idle),
            ConnectionState::Disconnected
        );
        assert_eq!(
            ConnectionState::from(ManagerState::Running),
            ConnectionState::Connected
        );
        assert_eq!(
            ConnectionState::from_manager(ManagerState::Running, true),
            ConnectionState::Reconnecting
        );
        assert_eq!(
            ConnectionState::from_manager(ManagerState::Stopped, true),
            ConnectionState::Closed
        );
        assert!(ConnectionState::Reconnecting.is_connecting());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut lifecycle = LifecycleState::new();
        assert!(lifecycle.get().can_start());

        lifecycle.transition_to(ManagerState::Starting);
        lifecycle.transition_to(ManagerState::Running);
        assert!(lifecycle.running_since().is_some());

        lifecycle.transition_to(ManagerState::Stopping);
        assert!(lifecycle.running_since().is_some());

        lifecycle.transition_to(ManagerState::Stopped);
        assert!(lifecycle.running_since().is_none());
        assert!(lifecycle.get().is_terminal());
        assert!(!lifecycle.get().can_start());
    }
}
