//! Run state machine types

use std::fmt;

use serde::{Deserialize, Serialize};

/// States of one script run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Created,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl RunState {
    /// Whether the run has finished
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Aborted | RunState::Failed
        )
    }

    /// Whether `next` is a legal successor
    ///
    /// A run that fails to compile goes straight from `Created` to `Failed`,
    /// as does one aborted before it starts.
    #[must_use]
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Created, RunState::Running | RunState::Failed | RunState::Aborted)
                | (
                    RunState::Running,
                    RunState::Completed | RunState::Aborted | RunState::Failed
                )
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(RunState::Created.can_transition_to(RunState::Running));
        assert!(RunState::Created.can_transition_to(RunState::Failed));
        assert!(RunState::Running.can_transition_to(RunState::Aborted));
        assert!(!RunState::Created.can_transition_to(RunState::Completed));
        assert!(!RunState::Completed.can_transition_to(RunState::Running));
        assert!(!RunState::Failed.can_transition_to(RunState::Aborted));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunState::Created.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Aborted.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert_eq!(RunState::Aborted.to_string(), "aborted");
    }
}
