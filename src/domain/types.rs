//! Shared domain enumerations.

use serde::{Deserialize, Serialize};

/// Lifecycle of a single render job.
///
/// The happy path is strictly linear:
/// `Received → Rendering → Persisted → Uploading → Cleanup → Completed`.
/// Any non-terminal state may fall through to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Received,
    Rendering,
    Persisted,
    Uploading,
    Cleanup,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Received => "received",
            JobState::Rendering => "rendering",
            JobState::Persisted => "persisted",
            JobState::Uploading => "uploading",
            JobState::Cleanup => "cleanup",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == JobState::Failed {
            return true;
        }
        matches!(
            (self, next),
            (JobState::Received, JobState::Rendering)
                | (JobState::Rendering, JobState::Persisted)
                | (JobState::Persisted, JobState::Uploading)
                | (JobState::Uploading, JobState::Cleanup)
                | (JobState::Cleanup, JobState::Completed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_linear() {
        let path = [
            JobState::Received,
            JobState::Rendering,
            JobState::Persisted,
            JobState::Uploading,
            JobState::Cleanup,
            JobState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{:?} -> {:?} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn stages_cannot_be_skipped() {
        assert!(!JobState::Received.can_transition_to(JobState::Persisted));
        assert!(!JobState::Rendering.can_transition_to(JobState::Uploading));
        assert!(!JobState::Uploading.can_transition_to(JobState::Completed));
    }

    #[test]
    fn terminal_states_are_final() {
        for next in [JobState::Received, JobState::Failed, JobState::Completed] {
            assert!(!JobState::Completed.can_transition_to(next));
            assert!(!JobState::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn any_live_state_may_fail() {
        for state in [
            JobState::Received,
            JobState::Rendering,
            JobState::Persisted,
            JobState::Uploading,
            JobState::Cleanup,
        ] {
            assert!(state.can_transition_to(JobState::Failed));
        }
    }
}
