use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::ExitStatus;

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Declared but not yet started
    Pending,
    /// Spawned, inside the liveness grace window
    Starting,
    /// Alive past the grace window
    Running,
    /// Graceful stop in progress
    Stopping,
    /// Waiting out restart backoff
    Restarting,
    /// Terminal: stopped or exited cleanly
    Stopped,
    /// Terminal or restart-eligible: setup error or abnormal exit
    Failed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Pending => write!(f, "pending"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Restarting => write!(f, "restarting"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// Classification of an observed process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Exit code 0
    Clean,
    /// Non-zero exit code, or killed by a signal (no code)
    Abnormal(Option<i32>),
}

impl ExitClass {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => ExitClass::Clean,
            code => ExitClass::Abnormal(code),
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitClass::Clean => Some(0),
            ExitClass::Abnormal(code) => *code,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ExitClass::Clean)
    }
}

/// Published snapshot of one managed process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restarts: usize,
    pub started_at: Option<DateTime<Utc>>,
}

impl ProcessStatus {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ProcessState::Pending,
            pid: None,
            restarts: 0,
            started_at: None,
        }
    }
}
