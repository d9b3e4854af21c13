use super::ReleaseError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseStatus::NotStarted => "not_started",
            ReleaseStatus::Running => "running",
            ReleaseStatus::Succeeded => "succeeded",
            ReleaseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Check if a release status is terminal (no further transitions allowed)
pub fn is_terminal(status: &ReleaseStatus) -> bool {
    matches!(status, ReleaseStatus::Succeeded | ReleaseStatus::Failed)
}

/// Check if a state transition is valid
pub fn is_valid_transition(from: &ReleaseStatus, to: &ReleaseStatus) -> bool {
    use ReleaseStatus::*;

    match (from, to) {
        (from, _) if is_terminal(from) => false,
        (NotStarted, Running) => true,
        (Running, Succeeded | Failed) => true,
        _ => false,
    }
}

/// Validate a state transition and return an error if invalid
pub fn validate_transition(from: &ReleaseStatus, to: &ReleaseStatus) -> Result<(), ReleaseError> {
    if !is_valid_transition(from, to) {
        return Err(ReleaseError::InvalidTransition {
            from: *from,
            to: *to,
        });
    }
    Ok(())
}

impl ReleaseStatus {
    /// Move to `to` if the transition is allowed
    pub fn transition(&mut self, to: ReleaseStatus) -> Result<(), ReleaseError> {
        validate_transition(self, &to)?;
        *self = to;
        Ok(())
    }
}
