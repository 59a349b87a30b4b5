//! Experiment status graph.
//!
//! Transitions are monotone along the graph below. The only backward edges are
//! the external `retry` reset (settled state -> draft) and the cancellation of an
//! in-flight validation (validating -> draft).
//!
//! ```text
//! draft -> validating -> created -> running -> completed | failed | stopped | timeout
//!          validating -> validation_failed | resource_unavailable | permission_error
//!          validating | created -> creation_failed | template_invalid | service_limit
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    #[default]
    Draft,
    Validating,
    Created,
    ValidationFailed,
    ResourceUnavailable,
    PermissionError,
    CreationFailed,
    TemplateInvalid,
    ServiceLimit,
    Running,
    Completed,
    Failed,
    Stopped,
    Timeout,
}

impl ExperimentStatus {
    pub const ALL: [ExperimentStatus; 14] = [
        ExperimentStatus::Draft,
        ExperimentStatus::Validating,
        ExperimentStatus::Created,
        ExperimentStatus::ValidationFailed,
        ExperimentStatus::ResourceUnavailable,
        ExperimentStatus::PermissionError,
        ExperimentStatus::CreationFailed,
        ExperimentStatus::TemplateInvalid,
        ExperimentStatus::ServiceLimit,
        ExperimentStatus::Running,
        ExperimentStatus::Completed,
        ExperimentStatus::Failed,
        ExperimentStatus::Stopped,
        ExperimentStatus::Timeout,
    ];

    /// Forward edges driven by the controller itself.
    pub fn allowed_transitions(&self) -> &'static [ExperimentStatus] {
        use ExperimentStatus as S;
        match self {
            S::Draft => &[S::Validating],
            S::Validating => &[
                S::Created,
                S::ValidationFailed,
                S::ResourceUnavailable,
                S::PermissionError,
                S::CreationFailed,
                S::TemplateInvalid,
                S::ServiceLimit,
                S::Draft,
            ],
            S::Created => &[
                S::Running,
                S::CreationFailed,
                S::TemplateInvalid,
                S::ServiceLimit,
            ],
            S::Running => &[S::Completed, S::Failed, S::Stopped, S::Timeout],
            S::ValidationFailed
            | S::ResourceUnavailable
            | S::PermissionError
            | S::CreationFailed
            | S::TemplateInvalid
            | S::ServiceLimit
            | S::Completed
            | S::Failed
            | S::Stopped
            | S::Timeout => &[],
        }
    }

    pub fn can_transition_to(&self, target: ExperimentStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// No automatic transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// An external call or pipeline may currently own the record.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ExperimentStatus::Validating | ExperimentStatus::Running)
    }

    /// Explicit external retry resets settled, non-draft records.
    pub fn can_retry(&self) -> bool {
        !matches!(
            self,
            ExperimentStatus::Draft | ExperimentStatus::Validating | ExperimentStatus::Running
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExperimentStatus::ValidationFailed
                | ExperimentStatus::ResourceUnavailable
                | ExperimentStatus::PermissionError
                | ExperimentStatus::CreationFailed
                | ExperimentStatus::TemplateInvalid
                | ExperimentStatus::ServiceLimit
                | ExperimentStatus::Failed
                | ExperimentStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Validating => "validating",
            ExperimentStatus::Created => "created",
            ExperimentStatus::ValidationFailed => "validation_failed",
            ExperimentStatus::ResourceUnavailable => "resource_unavailable",
            ExperimentStatus::PermissionError => "permission_error",
            ExperimentStatus::CreationFailed => "creation_failed",
            ExperimentStatus::TemplateInvalid => "template_invalid",
            ExperimentStatus::ServiceLimit => "service_limit",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Failed => "failed",
            ExperimentStatus::Stopped => "stopped",
            ExperimentStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExperimentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| format!("unknown experiment status '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_edges_are_allowed() {
        use ExperimentStatus as S;
        assert!(S::Draft.can_transition_to(S::Validating));
        assert!(S::Validating.can_transition_to(S::Created));
        assert!(S::Created.can_transition_to(S::Running));
        assert!(S::Running.can_transition_to(S::Completed));
        assert!(S::Running.can_transition_to(S::Timeout));
    }

    #[test]
    fn completed_never_returns_to_validating() {
        use ExperimentStatus as S;
        assert!(!S::Completed.can_transition_to(S::Validating));
        assert!(S::Completed.is_terminal());
        assert!(S::Completed.can_retry());
    }

    #[test]
    fn skipping_stages_is_forbidden() {
        use ExperimentStatus as S;
        assert!(!S::Draft.can_transition_to(S::Created));
        assert!(!S::Draft.can_transition_to(S::Running));
        assert!(!S::Validating.can_transition_to(S::Running));
        assert!(!S::Created.can_transition_to(S::Completed));
    }

    #[test]
    fn in_flight_states_cannot_retry() {
        assert!(!ExperimentStatus::Running.can_retry());
        assert!(!ExperimentStatus::Validating.can_retry());
        assert!(!ExperimentStatus::Draft.can_retry());
        assert!(ExperimentStatus::Timeout.can_retry());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in ExperimentStatus::ALL {
            assert_eq!(status.as_str().parse::<ExperimentStatus>(), Ok(status));
            let json = serde_json::to_string(&status).expect("json");
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }
}
