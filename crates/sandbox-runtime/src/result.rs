//! Run result and manager state types.

use std::fmt;

/// Lifecycle state of the manager, strictly monotonic within a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxState {
    /// Manager constructed, nothing started.
    Created,
    /// Modules are initializing in the parent.
    Initializing,
    /// Initialization done; about to fork.
    Preparing,
    /// Child process is running.
    Running,
    /// Child exited; cleanup in progress.
    Stopping,
    /// Run complete, resources released.
    Stopped,
    /// A parent-side phase failed.
    Error,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Initializing => write!(f, "initializing"),
            Self::Preparing => write!(f, "preparing"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// The outcome of one sandbox run, emitted exactly once per `run()`.
#[derive(Debug, Clone)]
pub struct SandboxResult {
    /// Child exit code; negative values encode the terminating signal.
    pub exit_code: i32,
    /// True iff the child exited normally with status 0.
    pub success: bool,
    /// Populated when the run failed or the child was signalled.
    pub error_message: Option<String>,
    /// Wall-clock duration of the run in milliseconds.
    pub execution_time_ms: u64,
    /// Captured child stdout.
    pub stdout: String,
    /// Pid of the child, when one was created.
    pub child_pid: Option<i32>,
}

impl SandboxResult {
    /// A failed result with no child, carrying an error message.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            success: false,
            error_message: Some(message.into()),
            execution_time_ms: 0,
            stdout: String::new(),
            child_pid: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(format!("{}", SandboxState::Created), "created");
        assert_eq!(format!("{}", SandboxState::Running), "running");
        assert_eq!(format!("{}", SandboxState::Stopped), "stopped");
        assert_eq!(format!("{}", SandboxState::Error), "error");
    }

    #[test]
    fn failure_result_carries_message() {
        let result = SandboxResult::failure("modules failed to initialize");
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert_eq!(
            result.error_message.as_deref(),
            Some("modules failed to initialize")
        );
        assert!(result.child_pid.is_none());
    }
}
