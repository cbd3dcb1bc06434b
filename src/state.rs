use std::fmt;

use crate::steps::Stage;

/// Progress of a provisioning run.
///
/// States only move forward one at a time. `Failed` can be entered from any
/// non-terminal state and never left; neither can `Complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionState {
    NotStarted,
    DependenciesInstalled,
    SourceAcquired,
    Configured,
    Built,
    Installed,
    EnvironmentRegistered,
    Complete,
    Failed { stage: Stage, cause: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: String,
    pub to: String,
}

impl ProvisionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisionState::Complete | ProvisionState::Failed { .. })
    }

    /// The state that follows this one on success.
    pub fn next(&self) -> Option<ProvisionState> {
        use ProvisionState::*;
        match self {
            NotStarted => Some(DependenciesInstalled),
            DependenciesInstalled => Some(SourceAcquired),
            SourceAcquired => Some(Configured),
            Configured => Some(Built),
            Built => Some(Installed),
            Installed => Some(EnvironmentRegistered),
            EnvironmentRegistered => Some(Complete),
            Complete | Failed { .. } => None,
        }
    }

    /// Move to `to`, which must be the immediate successor.
    pub fn advance_to(&mut self, to: ProvisionState) -> Result<(), InvalidTransition> {
        if self.next().as_ref() != Some(&to) {
            return Err(InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        *self = to;
        Ok(())
    }

    pub fn fail(&mut self, stage: Stage, cause: impl Into<String>) -> Result<(), InvalidTransition> {
        let failed = ProvisionState::Failed {
            stage,
            cause: cause.into(),
        };
        if self.is_terminal() {
            return Err(InvalidTransition {
                from: self.to_string(),
                to: failed.to_string(),
            });
        }
        *self = failed;
        Ok(())
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionState::NotStarted => f.write_str("not started"),
            ProvisionState::DependenciesInstalled => f.write_str("dependencies installed"),
            ProvisionState::SourceAcquired => f.write_str("source acquired"),
            ProvisionState::Configured => f.write_str("configured"),
            ProvisionState::Built => f.write_str("built"),
            ProvisionState::Installed => f.write_str("installed"),
            ProvisionState::EnvironmentRegistered => f.write_str("environment registered"),
            ProvisionState::Complete => f.write_str("complete"),
            ProvisionState::Failed { stage, .. } => write!(f, "failed during {stage}"),
        }
    }
}
