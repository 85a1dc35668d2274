use crate::artifacts::{SandboxArtifacts, STDOUT_PLACEHOLDER};
use crate::debug::DebugSession;
use crate::lifecycle::{validate_transition, AppState};
use crate::process::ProcessHandle;
use crate::CoreError;
use std::path::Path;
use std::time::Duration;
use storelaunch_runtime::{manifest_uri, ActivateOptions, JobAssigner, PlatformBackend, ProcessWait};
use storelaunch_schema::PackageIdentity;
use tracing::{debug, info, warn};

/// Exit code used to kill an app that overstayed its timeout, and reported
/// for a wait that timed out.
pub const TERMINATE_EXIT_CODE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    pub exit_code: u32,
    /// `false` when the wait timed out; `exit_code` is then the sentinel.
    pub completed: bool,
}

/// Operations the driver needs from a deployable application.
pub trait App {
    fn identity(&self) -> &PackageIdentity;

    fn state(&self) -> AppState;

    /// Register the package and block until deployment completes.
    fn add(&mut self) -> Result<(), CoreError>;

    /// Uninstall every installed version of the package family. Succeeds
    /// when nothing is installed.
    fn remove(&mut self) -> Result<(), CoreError>;

    fn start(
        &mut self,
        run_in_background: bool,
        test_app: bool,
        execution_args: &str,
    ) -> Result<(), CoreError>;

    /// Terminate the running app with [`TERMINATE_EXIT_CODE`].
    fn stop(&mut self) -> Result<(), CoreError>;

    /// `None` waits without limit.
    fn wait_for_exit(&mut self, timeout: Option<Duration>) -> Result<WaitOutcome, CoreError>;

    fn enable_debug(&mut self, debugger: Option<&str>) -> Result<(), CoreError>;

    fn disable_debug(&mut self) -> Result<(), CoreError>;

    fn stdout_content(&self) -> String;

    fn exit_code(&self) -> Result<u32, CoreError>;
}

struct JobTarget<'a> {
    name: String,
    assigner: &'a dyn JobAssigner,
}

/// A store-deployed application driven through a [`PlatformBackend`].
pub struct StoreApp<'a> {
    backend: &'a dyn PlatformBackend,
    identity: PackageIdentity,
    state: AppState,
    process: ProcessHandle,
    debug: DebugSession<'a>,
    artifacts: Option<SandboxArtifacts>,
    job: Option<JobTarget<'a>>,
}

impl<'a> StoreApp<'a> {
    pub fn new(backend: &'a dyn PlatformBackend, identity: PackageIdentity) -> Self {
        let debug = DebugSession::new(backend, identity.full_name().clone());
        Self {
            backend,
            identity,
            state: AppState::Created,
            process: ProcessHandle::empty(),
            debug,
            artifacts: None,
            job: None,
        }
    }

    /// Move the launched process into the job object `name` once it starts.
    pub fn with_job(mut self, name: impl Into<String>, assigner: &'a dyn JobAssigner) -> Self {
        self.job = Some(JobTarget {
            name: name.into(),
            assigner,
        });
        self
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    fn transition(&mut self, to: AppState) -> Result<(), CoreError> {
        validate_transition(self.state, to)?;
        debug!("{}: {} -> {to}", self.identity.full_name(), self.state);
        self.state = to;
        Ok(())
    }

    /// Best effort: only a process whose image lives next to the manifest is
    /// the app itself, and nothing here may fail the run.
    fn reassign_to_job(&self) {
        let Some(job) = &self.job else {
            return;
        };
        let Some(pid) = self.process.pid() else {
            return;
        };
        let image = match self.process.image_path() {
            Ok(image) => image,
            Err(e) => {
                warn!("cannot read the image path of process {pid}: {e}");
                return;
            }
        };
        let image_dir = image.parent().unwrap_or(Path::new(""));
        if image_dir != self.identity.manifest_dir() {
            debug!(
                "process {pid} runs from {}, not the package directory; leaving it out of job {}",
                image_dir.display(),
                job.name
            );
            return;
        }
        match job.assigner.assign(&job.name, pid) {
            Ok(()) => info!("assigned process {pid} to job {}", job.name),
            Err(e) => warn!("cannot assign process {pid} to job {}: {e}", job.name),
        }
    }
}

impl App for StoreApp<'_> {
    fn identity(&self) -> &PackageIdentity {
        &self.identity
    }

    fn state(&self) -> AppState {
        self.state
    }

    fn add(&mut self) -> Result<(), CoreError> {
        validate_transition(self.state, AppState::Installed)?;
        let uri = manifest_uri(self.identity.manifest_path());
        debug!("registering {uri}");
        self.backend.register_package(&uri)?;
        self.transition(AppState::Installed)
    }

    fn remove(&mut self) -> Result<(), CoreError> {
        let family = self.identity.family_name();
        let packages = self.backend.find_packages(family)?;
        if packages.is_empty() {
            debug!("nothing installed for {family}");
        }
        for package in &packages {
            info!("uninstalling {package}");
            self.backend.remove_package(package)?;
        }
        self.transition(AppState::Uninstalled)
    }

    fn start(
        &mut self,
        run_in_background: bool,
        test_app: bool,
        execution_args: &str,
    ) -> Result<(), CoreError> {
        validate_transition(self.state, AppState::Activated)?;

        self.artifacts = if test_app {
            let artifacts = SandboxArtifacts::locate(self.backend, self.identity.family_name())?;
            artifacts.clear()?;
            Some(artifacts)
        } else {
            None
        };

        let options = ActivateOptions {
            no_splash_screen: run_in_background,
        };
        let pid = self
            .backend
            .activate(self.identity.app_user_model_id(), execution_args, options)?;
        info!("process started, pid {pid}");

        let opened = self.backend.open_process(pid)?;
        self.process = ProcessHandle::from_open(pid, opened);
        self.transition(AppState::Activated)?;
        self.reassign_to_job();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CoreError> {
        validate_transition(self.state, AppState::Exited)?;
        self.process.terminate(TERMINATE_EXIT_CODE)?;
        self.transition(AppState::Exited)
    }

    fn wait_for_exit(&mut self, timeout: Option<Duration>) -> Result<WaitOutcome, CoreError> {
        validate_transition(self.state, AppState::Exited)?;
        if !self.process.is_open() {
            return Err(CoreError::NoProcess);
        }
        match self.process.wait(timeout)? {
            ProcessWait::TimedOut => {
                if self.state != AppState::TimedOut {
                    self.transition(AppState::TimedOut)?;
                }
                Ok(WaitOutcome {
                    exit_code: TERMINATE_EXIT_CODE,
                    completed: false,
                })
            }
            ProcessWait::Exited => {
                self.transition(AppState::Exited)?;
                Ok(WaitOutcome {
                    exit_code: self.exit_code()?,
                    completed: true,
                })
            }
        }
    }

    fn enable_debug(&mut self, debugger: Option<&str>) -> Result<(), CoreError> {
        self.debug.enable(debugger)
    }

    fn disable_debug(&mut self) -> Result<(), CoreError> {
        self.debug.disable()
    }

    fn stdout_content(&self) -> String {
        self.artifacts
            .as_ref()
            .map_or_else(|| STDOUT_PLACEHOLDER.to_owned(), SandboxArtifacts::read_stdout)
    }

    /// The app's own exit-code file wins over what the OS reports.
    fn exit_code(&self) -> Result<u32, CoreError> {
        if let Some(code) = self
            .artifacts
            .as_ref()
            .and_then(SandboxArtifacts::read_exit_code)
        {
            return Ok(code);
        }
        match self.process.os_exit_code()? {
            Some(code) => {
                info!("process has just exited with return code {}", code as i32);
                Ok(code)
            }
            None => {
                warn!("process is still running; reporting {TERMINATE_EXIT_CODE:#x}");
                Ok(TERMINATE_EXIT_CODE)
            }
        }
    }
}
