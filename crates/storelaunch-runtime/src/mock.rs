//! In-memory stand-in for the platform.
//!
//! Packages are "registered" by reading their manifest, activation hands out
//! fake pids and writes the sandbox artifacts a real app would leave behind,
//! and process time is simulated: a wait times out exactly when the requested
//! timeout is shorter than the scenario's run time. Nothing sleeps.

use crate::backend::{
    manifest_path_from_uri, ActivateOptions, DebugSettings, JobAssigner, OpenProcess,
    PlatformBackend, ProcessControl, ProcessWait,
};
use crate::prereq::{MissingPrereq, DESKTOP_COMPOSITION};
use crate::{RuntimeError, E_FAIL};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use storelaunch_schema::{
    family_name, full_name, parse_manifest_file, AppUserModelId, PackageFamilyName,
    PackageFullName,
};

/// Platform operations a scenario can force to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockOperation {
    Register,
    Remove,
    Activate,
    OpenProcess,
    Wait,
    Terminate,
    EnableDebug,
    DisableDebug,
    ContainerFolder,
    AssignJob,
}

impl MockOperation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register package",
            Self::Remove => "remove package",
            Self::Activate => "activate application",
            Self::OpenProcess => "open process",
            Self::Wait => "wait for process",
            Self::Terminate => "terminate process",
            Self::EnableDebug => "enable debugging",
            Self::DisableDebug => "disable debugging",
            Self::ContainerFolder => "resolve container folder",
            Self::AssignJob => "assign process to job",
        }
    }
}

/// Behaviour of the simulated platform, usually loaded from a TOML file.
///
/// ```toml
/// container_root = "/tmp/containers"
/// run_for_ms = 500
/// exit_code_file = "0x2a"
/// stdout = "3 tests passed"
/// fail = ["remove"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MockScenario {
    /// Parent of the per-family container folders. Defaults to a directory
    /// under the system temp dir.
    pub container_root: Option<PathBuf>,
    /// How long a launched app runs before exiting on its own.
    pub run_for_ms: u64,
    /// Exit code the OS reports for a process that exits on its own.
    pub exit_code: u32,
    /// Raw contents written to the sandboxed exit-code file on activation.
    pub exit_code_file: Option<String>,
    /// Contents written to the sandboxed stdout capture on activation.
    pub stdout: Option<String>,
    /// The pid is already gone by the time a handle is requested.
    pub exits_before_open: bool,
    /// Directory the process image reports. Defaults to the manifest directory.
    pub image_dir: Option<PathBuf>,
    pub job_support: bool,
    pub compositor_disabled: bool,
    /// Full names registered before the run starts.
    pub preinstalled: Vec<String>,
    pub fail: Vec<MockOperation>,
}

impl MockScenario {
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| RuntimeError::Scenario(format!("{}: {e}", path.display())))
    }

    fn container_root(&self) -> PathBuf {
        self.container_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("storelaunch-mock"))
    }
}

/// Every platform call the mock saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Register {
        manifest: PathBuf,
    },
    FindPackages {
        family: PackageFamilyName,
    },
    Remove {
        full_name: PackageFullName,
    },
    Activate {
        app: AppUserModelId,
        arguments: String,
        no_splash_screen: bool,
    },
    OpenProcess {
        pid: u32,
    },
    Wait {
        pid: u32,
        timeout: Option<Duration>,
    },
    Terminate {
        pid: u32,
        exit_code: u32,
    },
    EnableDebug {
        full_name: PackageFullName,
        debugger: Option<String>,
    },
    DisableDebug {
        full_name: PackageFullName,
    },
    ContainerFolder {
        family: PackageFamilyName,
    },
    AssignJob {
        job_name: String,
        pid: u32,
    },
}

#[derive(Debug)]
struct InstalledPackage {
    family: PackageFamilyName,
    manifest_dir: Option<PathBuf>,
}

#[derive(Debug)]
struct MockProcessState {
    image_dir: PathBuf,
    exited: bool,
    terminated_with: Option<u32>,
}

#[derive(Debug, Default)]
struct MockState {
    installed: BTreeMap<PackageFullName, InstalledPackage>,
    processes: BTreeMap<u32, MockProcessState>,
    calls: Vec<MockCall>,
    next_pid: u32,
}

#[derive(Clone)]
struct Shared {
    scenario: Arc<MockScenario>,
    state: Arc<Mutex<MockState>>,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::platform("mock", E_FAIL, format!("mutex poisoned: {e}")))
    }

    /// Record `call`, then fail if the scenario injects a failure for `op`.
    fn record(&self, op: Option<MockOperation>, call: MockCall) -> Result<(), RuntimeError> {
        self.lock()?.calls.push(call);
        match op {
            Some(op) if self.scenario.fail.contains(&op) => Err(RuntimeError::platform(
                op.as_str(),
                E_FAIL,
                "injected failure",
            )),
            _ => Ok(()),
        }
    }
}

/// Simulated platform. Clones share state, so a test can keep one handle
/// and inspect the calls made through another.
#[derive(Clone)]
pub struct MockBackend {
    shared: Shared,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(MockScenario::default())
    }
}

impl MockBackend {
    pub fn new(scenario: MockScenario) -> Self {
        let mut state = MockState {
            next_pid: 4000,
            ..MockState::default()
        };
        for full in &scenario.preinstalled {
            let full = PackageFullName::new(full.as_str());
            state.installed.insert(
                full.clone(),
                InstalledPackage {
                    family: family_of(&full),
                    manifest_dir: None,
                },
            );
        }
        Self {
            shared: Shared {
                scenario: Arc::new(scenario),
                state: Arc::new(Mutex::new(state)),
            },
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.shared
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn installed_packages(&self) -> Vec<PackageFullName> {
        self.shared
            .lock()
            .map(|state| state.installed.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Exit code each terminated process was killed with.
    pub fn terminated(&self) -> Vec<(u32, u32)> {
        self.shared
            .lock()
            .map(|state| {
                state
                    .processes
                    .iter()
                    .filter_map(|(pid, p)| p.terminated_with.map(|code| (*pid, code)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn write_artifacts(&self, family: &PackageFamilyName) -> Result<(), RuntimeError> {
        let container = self.shared.scenario.container_root().join(family.as_str());
        if let Some(stdout) = &self.shared.scenario.stdout {
            let dir = container.join("LocalState").join("AC");
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join("stdout.txt"), stdout)?;
        }
        if let Some(code) = &self.shared.scenario.exit_code_file {
            let dir = container.join("AC").join("Temp");
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join("exitcode.txt"), code)?;
        }
        Ok(())
    }
}

/// `Name_Version_Arch_Resource_Publisher` → `Name_Publisher`.
fn family_of(full: &PackageFullName) -> PackageFamilyName {
    let mut parts = full.split('_');
    let name = parts.next().unwrap_or_default();
    let publisher = parts.last().unwrap_or_default();
    PackageFamilyName::new(format!("{name}_{publisher}"))
}

impl PlatformBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn check_prereqs(&self) -> Vec<MissingPrereq> {
        if self.shared.scenario.compositor_disabled {
            vec![DESKTOP_COMPOSITION]
        } else {
            Vec::new()
        }
    }

    fn register_package(&self, manifest_uri: &str) -> Result<(), RuntimeError> {
        let manifest = manifest_path_from_uri(manifest_uri)?;
        self.shared.record(
            Some(MockOperation::Register),
            MockCall::Register {
                manifest: manifest.clone(),
            },
        )?;

        let parsed = parse_manifest_file(&manifest).map_err(|e| {
            RuntimeError::platform("register package", E_FAIL, format!("{}: {e}", manifest.display()))
        })?;
        let full = full_name(&parsed.identity);
        let family = family_name(&parsed.identity.name, &parsed.identity.publisher);
        self.shared.lock()?.installed.insert(
            full,
            InstalledPackage {
                family,
                manifest_dir: manifest.parent().map(Path::to_path_buf),
            },
        );
        Ok(())
    }

    fn find_packages(
        &self,
        family: &PackageFamilyName,
    ) -> Result<Vec<PackageFullName>, RuntimeError> {
        self.shared.record(
            None,
            MockCall::FindPackages {
                family: family.clone(),
            },
        )?;
        let state = self.shared.lock()?;
        Ok(state
            .installed
            .iter()
            .filter(|(_, pkg)| &pkg.family == family)
            .map(|(full, _)| full.clone())
            .collect())
    }

    fn remove_package(&self, full_name: &PackageFullName) -> Result<(), RuntimeError> {
        self.shared.record(
            Some(MockOperation::Remove),
            MockCall::Remove {
                full_name: full_name.clone(),
            },
        )?;
        match self.shared.lock()?.installed.remove(full_name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::platform(
                "remove package",
                // ERROR_INSTALL_PACKAGE_NOT_FOUND
                0x8007_3CF1_u32 as i32,
                format!("package {full_name} is not installed"),
            )),
        }
    }

    fn activate(
        &self,
        app: &AppUserModelId,
        arguments: &str,
        options: ActivateOptions,
    ) -> Result<u32, RuntimeError> {
        self.shared.record(
            Some(MockOperation::Activate),
            MockCall::Activate {
                app: app.clone(),
                arguments: arguments.to_owned(),
                no_splash_screen: options.no_splash_screen,
            },
        )?;

        let family = PackageFamilyName::new(app.split('!').next().unwrap_or_default());
        let manifest_dir = {
            let state = self.shared.lock()?;
            state
                .installed
                .values()
                .find(|pkg| pkg.family == family)
                .map(|pkg| pkg.manifest_dir.clone().unwrap_or_default())
        };
        let Some(manifest_dir) = manifest_dir else {
            return Err(RuntimeError::platform(
                "activate application",
                E_FAIL,
                format!("no package registered for {app}"),
            ));
        };

        self.write_artifacts(&family)?;

        let mut state = self.shared.lock()?;
        let pid = state.next_pid;
        state.next_pid += 4;
        let image_dir = self
            .shared
            .scenario
            .image_dir
            .clone()
            .unwrap_or(manifest_dir);
        state.processes.insert(
            pid,
            MockProcessState {
                image_dir,
                exited: self.shared.scenario.exits_before_open,
                terminated_with: None,
            },
        );
        Ok(pid)
    }

    fn open_process(&self, pid: u32) -> Result<OpenProcess, RuntimeError> {
        self.shared
            .record(Some(MockOperation::OpenProcess), MockCall::OpenProcess { pid })?;
        if self.shared.scenario.exits_before_open {
            return Ok(OpenProcess::AlreadyExited);
        }
        if !self.shared.lock()?.processes.contains_key(&pid) {
            return Err(RuntimeError::platform(
                "open process",
                // ERROR_INVALID_PARAMETER
                0x8007_0057_u32 as i32,
                format!("no process with pid {pid}"),
            ));
        }
        Ok(OpenProcess::Opened(Box::new(MockProcess {
            shared: self.shared.clone(),
            pid,
        })))
    }

    fn debug_settings(&self) -> Result<Box<dyn DebugSettings>, RuntimeError> {
        Ok(Box::new(MockDebugSettings {
            shared: self.shared.clone(),
        }))
    }

    fn container_folder(&self, family: &PackageFamilyName) -> Result<PathBuf, RuntimeError> {
        self.shared.record(
            Some(MockOperation::ContainerFolder),
            MockCall::ContainerFolder {
                family: family.clone(),
            },
        )?;
        Ok(self.shared.scenario.container_root().join(family.as_str()))
    }

    fn probe_job_support(&self) -> Option<Box<dyn JobAssigner>> {
        if self.shared.scenario.job_support {
            Some(Box::new(MockJobAssigner {
                shared: self.shared.clone(),
            }))
        } else {
            None
        }
    }
}

struct MockProcess {
    shared: Shared,
    pid: u32,
}

impl MockProcess {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MockProcessState) -> T,
    ) -> Result<T, RuntimeError> {
        let mut state = self.shared.lock()?;
        let process = state.processes.get_mut(&self.pid).ok_or_else(|| {
            RuntimeError::platform("process", E_FAIL, format!("unknown pid {}", self.pid))
        })?;
        Ok(f(process))
    }
}

impl ProcessControl for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<ProcessWait, RuntimeError> {
        self.shared.record(
            Some(MockOperation::Wait),
            MockCall::Wait {
                pid: self.pid,
                timeout,
            },
        )?;
        let run_for = Duration::from_millis(self.shared.scenario.run_for_ms);
        self.with_state(|process| {
            if process.exited || timeout.map_or(true, |t| t >= run_for) {
                process.exited = true;
                ProcessWait::Exited
            } else {
                ProcessWait::TimedOut
            }
        })
    }

    fn terminate(&self, exit_code: u32) -> Result<(), RuntimeError> {
        self.shared.record(
            Some(MockOperation::Terminate),
            MockCall::Terminate {
                pid: self.pid,
                exit_code,
            },
        )?;
        self.with_state(|process| {
            if !process.exited {
                process.exited = true;
                process.terminated_with = Some(exit_code);
            }
        })
    }

    fn exit_code(&self) -> Result<Option<u32>, RuntimeError> {
        let natural = self.shared.scenario.exit_code;
        self.with_state(|process| match (process.exited, process.terminated_with) {
            (_, Some(code)) => Some(code),
            (true, None) => Some(natural),
            (false, None) => None,
        })
    }

    fn image_path(&self) -> Result<PathBuf, RuntimeError> {
        self.with_state(|process| process.image_dir.join("App.exe"))
    }
}

struct MockDebugSettings {
    shared: Shared,
}

impl DebugSettings for MockDebugSettings {
    fn enable_debugging(
        &self,
        package: &PackageFullName,
        debugger: Option<&str>,
    ) -> Result<(), RuntimeError> {
        self.shared.record(
            Some(MockOperation::EnableDebug),
            MockCall::EnableDebug {
                full_name: package.clone(),
                debugger: debugger.map(str::to_owned),
            },
        )
    }

    fn disable_debugging(&self, package: &PackageFullName) -> Result<(), RuntimeError> {
        self.shared.record(
            Some(MockOperation::DisableDebug),
            MockCall::DisableDebug {
                full_name: package.clone(),
            },
        )
    }
}

struct MockJobAssigner {
    shared: Shared,
}

impl JobAssigner for MockJobAssigner {
    fn assign(&self, job_name: &str, pid: u32) -> Result<(), RuntimeError> {
        self.shared.record(
            Some(MockOperation::AssignJob),
            MockCall::AssignJob {
                job_name: job_name.to_owned(),
                pid,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::manifest_uri;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Package xmlns="http://schemas.microsoft.com/appx/manifest/foundation/windows10">
  <Identity Name="Contoso.Tests" Publisher="CN=Contoso" Version="1.0.0.0" ProcessorArchitecture="x64"/>
  <Applications><Application Id="App" Executable="App.exe"/></Applications>
</Package>"#;

    const FULL: &str = "Contoso.Tests_1.0.0.0_x64__h91ms92gdsmmt";
    const FAMILY: &str = "Contoso.Tests_h91ms92gdsmmt";

    fn write_manifest(dir: &Path) -> PathBuf {
        let path = dir.join("AppxManifest.xml");
        std::fs::write(&path, MANIFEST).unwrap();
        path
    }

    fn scenario(dir: &Path) -> MockScenario {
        MockScenario {
            container_root: Some(dir.join("containers")),
            ..MockScenario::default()
        }
    }

    fn aumid() -> AppUserModelId {
        AppUserModelId::new(format!("{FAMILY}!App"))
    }

    #[test]
    fn register_then_find_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path());
        let backend = MockBackend::new(scenario(dir.path()));

        backend.register_package(&manifest_uri(&manifest)).unwrap();
        let found = backend.find_packages(&PackageFamilyName::new(FAMILY)).unwrap();
        assert_eq!(found, vec![PackageFullName::new(FULL)]);

        backend.remove_package(&found[0]).unwrap();
        assert!(backend.installed_packages().is_empty());
        assert!(backend.remove_package(&found[0]).is_err());
    }

    #[test]
    fn preinstalled_versions_share_a_family() {
        let mut s = MockScenario::default();
        s.preinstalled = vec![
            "Contoso.Tests_0.9.0.0_x64__h91ms92gdsmmt".to_owned(),
            "Other_1.0.0.0_neutral__h91ms92gdsmmt".to_owned(),
        ];
        let backend = MockBackend::new(s);
        let found = backend.find_packages(&PackageFamilyName::new(FAMILY)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], "Contoso.Tests_0.9.0.0_x64__h91ms92gdsmmt");
    }

    #[test]
    fn activate_writes_sandbox_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path());
        let mut s = scenario(dir.path());
        s.stdout = Some("hello".to_owned());
        s.exit_code_file = Some("7".to_owned());
        let backend = MockBackend::new(s);
        backend.register_package(&manifest_uri(&manifest)).unwrap();

        let pid = backend
            .activate(&aumid(), "a b", ActivateOptions::default())
            .unwrap();
        assert!(pid > 0);

        let container = backend.container_folder(&PackageFamilyName::new(FAMILY)).unwrap();
        let stdout = std::fs::read_to_string(container.join("LocalState/AC/stdout.txt")).unwrap();
        assert_eq!(stdout, "hello");
        let code = std::fs::read_to_string(container.join("AC/Temp/exitcode.txt")).unwrap();
        assert_eq!(code, "7");
    }

    #[test]
    fn activate_requires_registration() {
        let backend = MockBackend::default();
        let err = backend
            .activate(&aumid(), "", ActivateOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), Some(E_FAIL));
    }

    #[test]
    fn wait_times_out_when_app_outlives_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path());
        let mut s = scenario(dir.path());
        s.run_for_ms = 5_000;
        s.exit_code = 3;
        let backend = MockBackend::new(s);
        backend.register_package(&manifest_uri(&manifest)).unwrap();
        let pid = backend
            .activate(&aumid(), "", ActivateOptions::default())
            .unwrap();

        let OpenProcess::Opened(process) = backend.open_process(pid).unwrap() else {
            panic!("expected an open handle");
        };
        assert_eq!(
            process.wait(Some(Duration::from_millis(100))).unwrap(),
            ProcessWait::TimedOut
        );
        assert_eq!(process.exit_code().unwrap(), None);

        process.terminate(u32::MAX).unwrap();
        assert_eq!(process.exit_code().unwrap(), Some(u32::MAX));
        assert_eq!(backend.terminated(), vec![(pid, u32::MAX)]);
    }

    #[test]
    fn wait_without_timeout_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path());
        let mut s = scenario(dir.path());
        s.run_for_ms = 60_000;
        s.exit_code = 3;
        let backend = MockBackend::new(s);
        backend.register_package(&manifest_uri(&manifest)).unwrap();
        let pid = backend
            .activate(&aumid(), "", ActivateOptions::default())
            .unwrap();

        let OpenProcess::Opened(process) = backend.open_process(pid).unwrap() else {
            panic!("expected an open handle");
        };
        assert_eq!(process.wait(None).unwrap(), ProcessWait::Exited);
        assert_eq!(process.exit_code().unwrap(), Some(3));
        assert_eq!(process.image_path().unwrap(), dir.path().join("App.exe"));
    }

    #[test]
    fn exits_before_open_reports_already_exited() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path());
        let mut s = scenario(dir.path());
        s.exits_before_open = true;
        let backend = MockBackend::new(s);
        backend.register_package(&manifest_uri(&manifest)).unwrap();
        let pid = backend
            .activate(&aumid(), "", ActivateOptions::default())
            .unwrap();
        assert!(matches!(
            backend.open_process(pid).unwrap(),
            OpenProcess::AlreadyExited
        ));
    }

    #[test]
    fn injected_failures_are_recorded_and_returned() {
        let mut s = MockScenario::default();
        s.fail = vec![MockOperation::EnableDebug];
        let backend = MockBackend::new(s);
        let debug = backend.debug_settings().unwrap();
        let full = PackageFullName::new(FULL);
        let err = debug.enable_debugging(&full, Some("vsjitdebugger.exe")).unwrap_err();
        assert_eq!(err.to_string(), "enable debugging failed: injected failure");
        debug.disable_debugging(&full).unwrap();
        assert_eq!(
            backend.calls(),
            vec![
                MockCall::EnableDebug {
                    full_name: full.clone(),
                    debugger: Some("vsjitdebugger.exe".to_owned()),
                },
                MockCall::DisableDebug { full_name: full },
            ]
        );
    }

    #[test]
    fn job_support_is_opt_in() {
        assert!(MockBackend::default().probe_job_support().is_none());
        let mut s = MockScenario::default();
        s.job_support = true;
        let backend = MockBackend::new(s);
        let jobs = backend.probe_job_support().unwrap();
        jobs.assign("harness-job", 4000).unwrap();
        assert_eq!(
            backend.calls(),
            vec![MockCall::AssignJob {
                job_name: "harness-job".to_owned(),
                pid: 4000,
            }]
        );
    }

    #[test]
    fn compositor_disabled_reports_missing_prereq() {
        let mut s = MockScenario::default();
        s.compositor_disabled = true;
        let missing = MockBackend::new(s).check_prereqs();
        assert_eq!(missing, vec![DESKTOP_COMPOSITION]);
    }

    #[test]
    fn scenario_loads_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.toml");
        std::fs::write(
            &path,
            "run_for_ms = 250\nexit_code_file = \"0x10\"\nfail = [\"remove\", \"assign_job\"]\n",
        )
        .unwrap();
        let s = MockScenario::load(&path).unwrap();
        assert_eq!(s.run_for_ms, 250);
        assert_eq!(s.exit_code_file.as_deref(), Some("0x10"));
        assert_eq!(s.fail, vec![MockOperation::Remove, MockOperation::AssignJob]);
    }

    #[test]
    fn scenario_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.toml");
        std::fs::write(&path, "run_for = 1\n").unwrap();
        assert!(matches!(
            MockScenario::load(&path),
            Err(RuntimeError::Scenario(_))
        ));
    }
}
