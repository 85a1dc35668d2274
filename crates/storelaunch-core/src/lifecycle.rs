use crate::CoreError;
use std::fmt;

/// Where one application is in its install → run → uninstall sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppState {
    Created,
    Installed,
    Activated,
    Exited,
    TimedOut,
    Uninstalled,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Installed => "installed",
            Self::Activated => "activated",
            Self::Exited => "exited",
            Self::TimedOut => "timed-out",
            Self::Uninstalled => "uninstalled",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(from: AppState, to: AppState) -> Result<(), CoreError> {
    // Removal is allowed from anywhere: it is also the recovery path.
    let valid = matches!(
        (from, to),
        (AppState::Created | AppState::Uninstalled, AppState::Installed)
            | (_, AppState::Uninstalled)
            | (AppState::Installed, AppState::Activated)
            | (AppState::Activated, AppState::Exited | AppState::TimedOut)
            | (AppState::TimedOut, AppState::Exited)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(AppState::Created, AppState::Uninstalled).is_ok());
        assert!(validate_transition(AppState::Uninstalled, AppState::Installed).is_ok());
        assert!(validate_transition(AppState::Created, AppState::Installed).is_ok());
        assert!(validate_transition(AppState::Installed, AppState::Activated).is_ok());
        assert!(validate_transition(AppState::Activated, AppState::Exited).is_ok());
        assert!(validate_transition(AppState::Activated, AppState::TimedOut).is_ok());
        assert!(validate_transition(AppState::TimedOut, AppState::Exited).is_ok());
        assert!(validate_transition(AppState::Activated, AppState::Uninstalled).is_ok());
        assert!(validate_transition(AppState::Uninstalled, AppState::Uninstalled).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(AppState::Created, AppState::Activated).is_err());
        assert!(validate_transition(AppState::Uninstalled, AppState::Activated).is_err());
        assert!(validate_transition(AppState::Installed, AppState::Installed).is_err());
        assert!(validate_transition(AppState::Installed, AppState::Exited).is_err());
        assert!(validate_transition(AppState::Exited, AppState::Activated).is_err());
        assert!(validate_transition(AppState::Exited, AppState::TimedOut).is_err());
    }

    #[test]
    fn invalid_transition_message_names_both_states() {
        let err = validate_transition(AppState::Created, AppState::Exited).unwrap_err();
        assert_eq!(err.to_string(), "invalid state transition: created -> exited");
    }
}
