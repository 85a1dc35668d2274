use crate::CoreError;
use std::path::PathBuf;
use std::time::Duration;
use storelaunch_runtime::{OpenProcess, ProcessControl, ProcessWait};
use tracing::{debug, warn};

/// Owns the handle to a launched application, if one could be opened.
///
/// A handle is absent before activation, after `close`, and when the process
/// had already gone by the time the launcher asked for it.
#[derive(Default)]
pub struct ProcessHandle {
    inner: Option<Box<dyn ProcessControl>>,
    exited_before_open: bool,
}

impl ProcessHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_open(pid: u32, open: OpenProcess) -> Self {
        match open {
            OpenProcess::Opened(process) => {
                debug!("opened process {pid}");
                Self {
                    inner: Some(process),
                    exited_before_open: false,
                }
            }
            OpenProcess::AlreadyExited => {
                // The pid was rejected as invalid. That almost always means the
                // app finished before we could look at it, but it is a guess.
                warn!("process {pid} was gone before a handle could be opened; assuming it already exited");
                Self {
                    inner: None,
                    exited_before_open: true,
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn exited_before_open(&self) -> bool {
        self.exited_before_open
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.as_ref().map(|p| p.pid())
    }

    fn control(&self) -> Result<&dyn ProcessControl, CoreError> {
        self.inner.as_deref().ok_or(CoreError::NoProcess)
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<ProcessWait, CoreError> {
        Ok(self.control()?.wait(timeout)?)
    }

    /// Kill the process with `exit_code` and release the handle. Without a
    /// handle this does nothing.
    pub fn terminate(&mut self, exit_code: u32) -> Result<(), CoreError> {
        if let Some(process) = &self.inner {
            process.terminate(exit_code)?;
            debug!("terminated process {} with {exit_code:#x}", process.pid());
        }
        self.close();
        Ok(())
    }

    pub fn os_exit_code(&self) -> Result<Option<u32>, CoreError> {
        Ok(self.control()?.exit_code()?)
    }

    pub fn image_path(&self) -> Result<PathBuf, CoreError> {
        Ok(self.control()?.image_path()?)
    }

    pub fn close(&mut self) {
        self.inner = None;
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid())
            .field("exited_before_open", &self.exited_before_open)
            .finish()
    }
}
