//! Top-level run sequencing: system checks, locking, install, execute with
//! recovery, uninstall, and the exit code that comes out of it.

use crate::app::{App, StoreApp};
use crate::concurrency::ExecutionLock;
use crate::disambiguate::FileDisambiguator;
use crate::CoreError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use storelaunch_runtime::{format_missing, PlatformBackend};
use storelaunch_schema::{PackageFullName, PackageIdentity};
use tracing::{debug, error, info, warn};

/// Exit code of a successful install-only or uninstall-only run.
pub const MAINTENANCE_EXIT_CODE: u32 = 100;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(120_000);
pub const LOCK_FILE_NAME: &str = "appxExecution.lock";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Reinstall, launch, wait, collect and uninstall.
    #[default]
    Run,
    InstallOnly,
    UninstallOnly,
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub manifest_path: PathBuf,
    pub app_id: Option<String>,
    /// Debugger command line. When set the exit wait is unbounded.
    pub debugger: Option<String>,
    pub timeout: Duration,
    pub test_app: bool,
    pub run_in_background: bool,
    pub delay_launch: Duration,
    pub mode: RunMode,
    pub execution_args: Vec<String>,
    pub disambiguation_prefix: String,
    pub disambiguated_files: Vec<PathBuf>,
    /// Job object to move the app into.
    pub job_name: Option<String>,
    pub lock_path: PathBuf,
    pub check_prereqs: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::new(),
            app_id: None,
            debugger: None,
            timeout: DEFAULT_TIMEOUT,
            test_app: false,
            run_in_background: true,
            delay_launch: Duration::ZERO,
            mode: RunMode::Run,
            execution_args: Vec::new(),
            disambiguation_prefix: String::new(),
            disambiguated_files: Vec::new(),
            job_name: None,
            lock_path: PathBuf::from(LOCK_FILE_NAME),
            check_prereqs: true,
        }
    }
}

impl LaunchOptions {
    /// Execution arguments as the single string handed to activation.
    pub fn arguments(&self) -> String {
        self.execution_args.join(" ")
    }

    /// `None` when a debugger is attached: a paused app must not be killed.
    pub fn wait_timeout(&self) -> Option<Duration> {
        match self.debugger.as_deref() {
            Some(d) if !d.is_empty() => None,
            _ => Some(self.timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOutcome {
    pub exit_code: u32,
    /// Captured console output of a test app.
    pub app_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub exit_code: u32,
    pub app_output: Option<String>,
    /// Set by an install-only run.
    pub package_full_name: Option<PackageFullName>,
}

/// Remove any previous installation, then install. A failure triggers a
/// best-effort removal before it is returned.
pub fn install(app: &mut dyn App) -> Result<(), CoreError> {
    info!("removing any previous installation...");
    let result = app.remove().and_then(|()| {
        info!("installing the application...");
        app.add()
    });
    if let Err(e) = result {
        error!("install failed: {e}");
        cleanup(app);
        return Err(e);
    }
    Ok(())
}

pub fn uninstall(app: &mut dyn App) -> Result<(), CoreError> {
    info!("removing the application...");
    app.remove()
}

/// Launch the installed app and wait for it. Any failure uninstalls the app
/// before it is returned.
pub fn execute(app: &mut dyn App, options: &LaunchOptions) -> Result<ExecuteOutcome, CoreError> {
    match execute_steps(app, options) {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            error!("execution failed: {e}");
            cleanup(app);
            Err(e)
        }
    }
}

fn execute_steps(app: &mut dyn App, options: &LaunchOptions) -> Result<ExecuteOutcome, CoreError> {
    // Registration happens even without a debugger; activation can time out otherwise.
    app.enable_debug(options.debugger.as_deref())?;

    if !options.delay_launch.is_zero() {
        info!("waiting for {}ms before launch...", options.delay_launch.as_millis());
        std::thread::sleep(options.delay_launch);
    }

    info!("starting the application...");
    app.start(options.run_in_background, options.test_app, &options.arguments())?;

    let timeout = options.wait_timeout();
    match timeout {
        Some(t) => info!("waiting for {}ms...", t.as_millis()),
        None => info!("waiting for the application to exit..."),
    }
    let outcome = app.wait_for_exit(timeout)?;

    if !outcome.completed {
        if options.test_app {
            info!(
                "the app did not exit within {}ms - stopping the app...",
                options.timeout.as_millis()
            );
        } else {
            info!("stopping the app...");
        }
        app.stop()?;
    }

    info!("disabling the debugger...");
    app.disable_debug()?;

    if options.test_app {
        Ok(ExecuteOutcome {
            exit_code: outcome.exit_code,
            app_output: Some(app.stdout_content()),
        })
    } else if outcome.completed {
        Err(CoreError::Crashed)
    } else {
        Ok(ExecuteOutcome {
            exit_code: outcome.exit_code,
            app_output: None,
        })
    }
}

fn cleanup(app: &mut dyn App) {
    info!("removing the application...");
    if let Err(e) = app.remove() {
        warn!("cleanup uninstall failed: {e}");
    }
}

/// Initialize the platform and verify the environment can host the app.
pub fn prepare_system(backend: &dyn PlatformBackend, check_prereqs: bool) -> Result<(), CoreError> {
    backend.initialize()?;
    if check_prereqs {
        let missing = backend.check_prereqs();
        if !missing.is_empty() {
            return Err(CoreError::Prerequisites(format_missing(&missing)));
        }
    }
    Ok(())
}

fn check_manifest_exists(path: &Path) -> Result<(), CoreError> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(CoreError::ManifestNotFound(path.to_path_buf()))
        }
        Err(e) if e.kind() == ErrorKind::InvalidInput => {
            Err(CoreError::ManifestInvalidPath(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// One complete launcher run.
pub fn run(backend: &dyn PlatformBackend, options: &LaunchOptions) -> Result<RunReport, CoreError> {
    debug!("using {} backend", backend.name());
    prepare_system(backend, options.check_prereqs)?;

    let _lock = ExecutionLock::acquire(&options.lock_path)?;
    let _files = FileDisambiguator::new(
        &options.disambiguation_prefix,
        &options.disambiguated_files,
        options.mode != RunMode::UninstallOnly,
        options.mode != RunMode::InstallOnly,
    );

    check_manifest_exists(&options.manifest_path)?;
    let identity = PackageIdentity::resolve(&options.manifest_path, options.app_id.as_deref())?;
    debug!("package full name {}", identity.full_name());
    debug!("package family name {}", identity.family_name());
    debug!("application user model id {}", identity.app_user_model_id());

    // Probed once; the app only borrows it.
    let jobs = match &options.job_name {
        Some(_) if options.mode == RunMode::Run => backend.probe_job_support(),
        _ => None,
    };
    let mut app = StoreApp::new(backend, identity);
    if let (Some(name), Some(jobs)) = (&options.job_name, &jobs) {
        app = app.with_job(name.as_str(), jobs.as_ref());
    }

    match options.mode {
        RunMode::UninstallOnly => {
            uninstall(&mut app)?;
            Ok(RunReport {
                exit_code: MAINTENANCE_EXIT_CODE,
                app_output: None,
                package_full_name: None,
            })
        }
        RunMode::InstallOnly => {
            install(&mut app)?;
            Ok(RunReport {
                exit_code: MAINTENANCE_EXIT_CODE,
                app_output: None,
                package_full_name: Some(app.identity().full_name().clone()),
            })
        }
        RunMode::Run => {
            install(&mut app)?;
            let outcome = execute(&mut app, options)?;
            uninstall(&mut app)?;
            Ok(RunReport {
                exit_code: outcome.exit_code,
                app_output: outcome.app_output,
                package_full_name: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_behaviour() {
        let options = LaunchOptions::default();
        assert_eq!(options.timeout, Duration::from_millis(120_000));
        assert!(options.run_in_background);
        assert_eq!(options.mode, RunMode::Run);
        assert_eq!(options.lock_path, PathBuf::from("appxExecution.lock"));
        assert_eq!(options.wait_timeout(), Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn debugger_makes_wait_unbounded() {
        let options = LaunchOptions {
            debugger: Some("vsjitdebugger.exe -p %d".to_owned()),
            ..LaunchOptions::default()
        };
        assert_eq!(options.wait_timeout(), None);

        let empty = LaunchOptions {
            debugger: Some(String::new()),
            ..LaunchOptions::default()
        };
        assert_eq!(empty.wait_timeout(), Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn execution_args_are_space_joined() {
        let options = LaunchOptions {
            execution_args: vec!["-run".to_owned(), "suite.dll".to_owned()],
            ..LaunchOptions::default()
        };
        assert_eq!(options.arguments(), "-run suite.dll");
    }

    #[test]
    fn missing_manifest_is_reported_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AppxManifest.xml");
        assert!(matches!(
            check_manifest_exists(&path),
            Err(CoreError::ManifestNotFound(p)) if p == path
        ));
    }
}
