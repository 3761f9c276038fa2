use serde::{Deserialize, Serialize};

/// Executor lifecycle states
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorState {
    #[default]
    Idle,
    Running,
    /// No new units are pulled; in-flight units finish their traversal
    Draining,
    Completed,
    Failed {
        error_msg: String,
    },
}

impl ExecutorState {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &ExecutorState) -> bool {
        use ExecutorState::*;

        matches!(
            (self, target),
            (Idle, Running)
                | (Running, Draining)
                | (Running, Failed { .. })
                | (Draining, Completed)
                | (Draining, Failed { .. })
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// Get human-readable state name
    pub fn name(&self) -> &str {
        match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Draining => "Draining",
            Self::Completed => "Completed",
            Self::Failed { .. } => "Failed",
        }
    }
}
