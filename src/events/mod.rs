//! Lifecycle event stream consumed by external reporting collaborators.

use crate::supervisor::state::ProcessState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

/// One lifecycle transition of a managed process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Process name
    pub process: String,
    /// State before the transition
    pub from: ProcessState,
    /// State after the transition
    pub to: ProcessState,
    /// When the transition was observed
    pub at: DateTime<Utc>,
    /// Exit code, when the transition was driven by a process exit
    pub exit_code: Option<i32>,
    /// Set when a graceful stop timed out and the process was killed
    pub forced_kill: bool,
}

impl LifecycleEvent {
    pub fn new(process: impl Into<String>, from: ProcessState, to: ProcessState) -> Self {
        Self {
            process: process.into(),
            from,
            to,
            at: Utc::now(),
            exit_code: None,
            forced_kill: false,
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn forced(mut self) -> Self {
        self.forced_kill = true;
        self
    }
}

/// Sink for lifecycle transitions
///
/// Every state transition and error is reported here, in order per
/// process.
pub trait EventReporter: Send + Sync {
    fn report(&self, event: LifecycleEvent);
}

/// Reporter that writes structured log records
#[derive(Debug, Default)]
pub struct LogReporter;

impl EventReporter for LogReporter {
    fn report(&self, event: LifecycleEvent) {
        info!(
            process = %event.process,
            from = %event.from,
            to = %event.to,
            exit_code = ?event.exit_code,
            forced_kill = event.forced_kill,
            "Lifecycle transition"
        );
    }
}

/// Reporter that forwards events over a channel, for embedders and tests
#[derive(Debug)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventReporter for ChannelReporter {
    fn report(&self, event: LifecycleEvent) {
        // A closed receiver just means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = LifecycleEvent::new("web", ProcessState::Running, ProcessState::Stopped)
            .with_exit_code(Some(0));

        assert_eq!(event.process, "web");
        assert_eq!(event.from, ProcessState::Running);
        assert_eq!(event.to, ProcessState::Stopped);
        assert_eq!(event.exit_code, Some(0));
        assert!(!event.forced_kill);
    }

    #[tokio::test]
    async fn test_channel_reporter_forwards_in_order() {
        let (reporter, mut rx) = ChannelReporter::new();

        reporter.report(LifecycleEvent::new(
            "web",
            ProcessState::Pending,
            ProcessState::Starting,
        ));
        reporter.report(LifecycleEvent::new(
            "web",
            ProcessState::Starting,
            ProcessState::Running,
        ));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.to, ProcessState::Starting);
        assert_eq!(second.to, ProcessState::Running);
    }

    #[tokio::test]
    async fn test_channel_reporter_ignores_closed_receiver() {
        let (reporter, rx) = ChannelReporter::new();
        drop(rx);

        // Must not panic
        reporter.report(LifecycleEvent::new(
            "web",
            ProcessState::Running,
            ProcessState::Stopped,
        ));
    }
}
