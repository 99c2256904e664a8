//! ABOUTME: Job status transitions and capability predicates
//! ABOUTME: A pure, allocation-free validator over the `JobStatus` lattice

use gl_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle states a job can be in at rest (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Paused,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Paused => "paused",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// True for states that never transition out on their own (§4.6).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The allowed-transitions table from §4.6, checked exhaustively so a new
/// `JobStatus` variant forces this match to be revisited.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    match from {
        Pending => matches!(to, Scheduled | Running | Cancelled),
        Scheduled => matches!(to, Running | Pending | Paused | Cancelled),
        Paused => matches!(to, Scheduled | Pending | Cancelled),
        Running => matches!(to, Completed | Failed | Scheduled | Cancelled),
        Completed => matches!(to, Scheduled),
        Failed => matches!(to, Pending),
        Cancelled => false,
    }
}

/// Validate and describe a rejected transition (§7 "Invalid state
/// transitions ... rejected with an explanatory error; no mutation").
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition(format!(
            "cannot transition job from {} to {}",
            from, to
        )))
    }
}

pub fn can_pause(status: JobStatus) -> bool {
    status == JobStatus::Scheduled
}

pub fn can_resume(status: JobStatus) -> bool {
    status == JobStatus::Paused
}

pub fn can_cancel(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Scheduled | JobStatus::Running | JobStatus::Paused | JobStatus::Pending
    )
}

pub fn can_retry(status: JobStatus) -> bool {
    status == JobStatus::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    const ALL: [JobStatus; 7] = [
        Pending, Scheduled, Paused, Running, Completed, Failed, Cancelled,
    ];

    #[test]
    fn allowed_transitions_match_table() {
        let allowed: &[(JobStatus, JobStatus)] = &[
            (Pending, Scheduled),
            (Pending, Running),
            (Pending, Cancelled),
            (Scheduled, Running),
            (Scheduled, Pending),
            (Scheduled, Paused),
            (Scheduled, Cancelled),
            (Paused, Scheduled),
            (Paused, Pending),
            (Paused, Cancelled),
            (Running, Completed),
            (Running, Failed),
            (Running, Scheduled),
            (Running, Cancelled),
            (Completed, Scheduled),
            (Failed, Pending),
        ];

        for &from in ALL.iter() {
            for &to in ALL.iter() {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    can_transition(from, to),
                    expected,
                    "transition {:?} -> {:?} expected {}",
                    from,
                    to,
                    expected
                );
            }
        }
    }

    #[test]
    fn cancelled_is_terminal_with_no_transitions() {
        for &to in ALL.iter() {
            assert!(!can_transition(Cancelled, to));
        }
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn validate_transition_rejects_with_explanation() {
        let err = validate_transition(Completed, Running).unwrap_err();
        assert!(err.to_string().contains("completed"));
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn capability_predicates() {
        assert!(can_pause(Scheduled));
        assert!(!can_pause(Running));
        assert!(can_resume(Paused));
        assert!(can_cancel(Pending));
        assert!(can_cancel(Running));
        assert!(!can_cancel(Completed));
        assert!(can_retry(Failed));
        assert!(!can_retry(Scheduled));
    }
}
