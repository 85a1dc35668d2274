//! Platform backends for storelaunch.
//!
//! This crate is the seam between the lifecycle orchestrator and the
//! operating system: the `PlatformBackend` trait exposes package deployment,
//! application activation, process control, debugger registration, app
//! container lookup and job-object reassignment as blocking calls. The
//! Windows backend drives the real platform APIs; the mock backend simulates
//! them in memory so the lifecycle can be exercised anywhere.

pub mod backend;
pub mod mock;
pub mod prereq;
#[cfg(windows)]
pub mod win;

pub use backend::{
    manifest_path_from_uri, manifest_uri, select_backend, ActivateOptions, DebugSettings,
    JobAssigner, OpenProcess, PlatformBackend, ProcessControl, ProcessWait,
};
pub use mock::{MockBackend, MockCall, MockOperation, MockScenario};
pub use prereq::{format_missing, MissingPrereq};

use thiserror::Error;

/// Generic failure code reported when the platform gives no better one.
pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("{operation} failed: {message}")]
    Platform {
        operation: &'static str,
        code: i32,
        message: String,
    },
    #[error("invalid mock scenario: {0}")]
    Scenario(String),
    #[error("invalid manifest URI: {0}")]
    InvalidUri(String),
}

impl RuntimeError {
    pub fn platform(operation: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self::Platform {
            operation,
            code,
            message: message.into(),
        }
    }

    /// HRESULT-style code for the failure, when the platform reported one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Platform { code, .. } => Some(*code),
            Self::Io(e) => e.raw_os_error().map(hresult_from_win32),
            _ => None,
        }
    }
}

/// Map a Win32 error code into the HRESULT facility, as `HRESULT_FROM_WIN32` does.
pub fn hresult_from_win32(code: i32) -> i32 {
    if code <= 0 {
        code
    } else {
        ((code as u32 & 0x0000_FFFF) | 0x8007_0000) as i32
    }
}
