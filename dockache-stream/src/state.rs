//! Replicator lifecycle states.

/// State machine of a change-stream replicator.
///
/// ```text
/// Idle -> Starting -> Running -> (BackingOff -> Starting)* -> Stopping -> Shutdown
///                                 BackingOff -> Failed (retry budget exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Created, not yet started.
    Idle,
    /// Opening the stream and launching the consumer.
    Starting,
    /// Dispatching events.
    Running,
    /// Waiting out a reconnect delay after a failure or terminal event.
    BackingOff,
    /// Shutdown requested; closing the stream and draining the queue.
    Stopping,
    /// Retry budget exhausted; terminal.
    Failed,
    /// Cleanly stopped; terminal.
    Shutdown,
}

impl ReplicatorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicatorState::Failed | ReplicatorState::Shutdown)
    }
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplicatorState::Idle => "idle",
            ReplicatorState::Starting => "starting",
            ReplicatorState::Running => "running",
            ReplicatorState::BackingOff => "backing_off",
            ReplicatorState::Stopping => "stopping",
            ReplicatorState::Failed => "failed",
            ReplicatorState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}
