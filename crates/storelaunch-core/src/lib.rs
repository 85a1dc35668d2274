//! Lifecycle orchestration for storelaunch.
//!
//! This crate ties the manifest-derived `PackageIdentity` to a platform
//! backend through the `App` trait and its store-deployed implementation
//! `StoreApp`, and sequences install, launch, wait, artifact collection and
//! uninstall in the `driver`. It also provides the cross-process execution
//! lock and the file disambiguation helper used around a run.

pub mod app;
pub mod artifacts;
pub mod concurrency;
pub mod debug;
pub mod disambiguate;
pub mod driver;
pub mod lifecycle;
pub mod process;

pub use app::{App, StoreApp, WaitOutcome, TERMINATE_EXIT_CODE};
pub use artifacts::{parse_exit_code, SandboxArtifacts, STDOUT_PLACEHOLDER};
pub use concurrency::ExecutionLock;
pub use debug::DebugSession;
pub use disambiguate::FileDisambiguator;
pub use driver::{
    execute, install, prepare_system, run, uninstall, ExecuteOutcome, LaunchOptions, RunMode,
    RunReport, DEFAULT_TIMEOUT, LOCK_FILE_NAME, MAINTENANCE_EXIT_CODE,
};
pub use lifecycle::{validate_transition, AppState};
pub use process::ProcessHandle;

use std::path::PathBuf;
use storelaunch_runtime::{hresult_from_win32, RuntimeError, E_FAIL};
use storelaunch_schema::IdentityError;
use thiserror::Error;

const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;
const E_POINTER: i32 = 0x8000_4003_u32 as i32;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Identity(#[from] IdentityError),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{}: does not exist", .0.display())]
    ManifestNotFound(PathBuf),
    #[error("{}: is not a valid path", .0.display())]
    ManifestInvalidPath(PathBuf),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: AppState, to: AppState },
    #[error("no process handle: the application is not running under this launcher")]
    NoProcess,
    #[error("the app exited before the timeout and most likely crashed")]
    Crashed,
    #[error("{0}")]
    Prerequisites(String),
    #[error("lock error on '{}': {reason}", .path.display())]
    Lock { path: PathBuf, reason: String },
}

impl CoreError {
    /// Errors caused by what the caller asked for rather than by the platform.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::Identity(_) | Self::ManifestNotFound(_) | Self::ManifestInvalidPath(_)
        )
    }

    /// HRESULT-style code for the failure report, when one applies.
    pub fn hresult(&self) -> Option<i32> {
        match self {
            Self::Runtime(e) => e.code(),
            Self::Io(e) => e.raw_os_error().map(hresult_from_win32),
            Self::Identity(_) => Some(E_INVALIDARG),
            Self::NoProcess => Some(E_POINTER),
            Self::Crashed => Some(E_FAIL),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_errors_are_invalid_arguments() {
        let err = CoreError::from(IdentityError::NoApplications);
        assert!(err.is_invalid_argument());
        assert_eq!(err.hresult(), Some(E_INVALIDARG));
        assert!(!CoreError::Crashed.is_invalid_argument());
    }

    #[test]
    fn runtime_errors_keep_platform_code() {
        let err = CoreError::from(RuntimeError::platform("activate application", -5, "denied"));
        assert_eq!(err.hresult(), Some(-5));
        assert_eq!(err.to_string(), "activate application failed: denied");
    }

    #[test]
    fn manifest_errors_name_the_path() {
        let err = CoreError::ManifestNotFound(PathBuf::from("missing.xml"));
        assert_eq!(err.to_string(), "missing.xml: does not exist");
        assert_eq!(err.hresult(), None);
    }

    #[test]
    fn crash_reports_generic_failure() {
        assert_eq!(CoreError::Crashed.hresult(), Some(E_FAIL));
        assert_eq!(CoreError::NoProcess.hresult().map(|c| c as u32), Some(0x8000_4003));
    }
}
