use crate::prereq::MissingPrereq;
use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use storelaunch_schema::{AppUserModelId, PackageFamilyName, PackageFullName};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivateOptions {
    /// Skip the splash screen. Set for background launches.
    pub no_splash_screen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessWait {
    Exited,
    TimedOut,
}

/// Outcome of opening a handle to a freshly activated process.
pub enum OpenProcess {
    Opened(Box<dyn ProcessControl>),
    /// The pid was no longer valid when the handle was requested. Most
    /// likely the app ran to completion already, but the platform cannot
    /// tell that apart from other races.
    AlreadyExited,
}

impl std::fmt::Debug for OpenProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened(process) => write!(f, "Opened(pid {})", process.pid()),
            Self::AlreadyExited => f.write_str("AlreadyExited"),
        }
    }
}

/// An owned handle to a running (or exited) application process. Dropping
/// it releases the handle; it never kills the process.
pub trait ProcessControl {
    fn pid(&self) -> u32;

    /// Block until the process exits or `timeout` elapses. `None` waits forever.
    fn wait(&self, timeout: Option<Duration>) -> Result<ProcessWait, RuntimeError>;

    fn terminate(&self, exit_code: u32) -> Result<(), RuntimeError>;

    /// Exit code reported by the OS, `None` while the process is still running.
    fn exit_code(&self) -> Result<Option<u32>, RuntimeError>;

    /// Full path of the process image.
    fn image_path(&self) -> Result<PathBuf, RuntimeError>;
}

/// Registration service that attaches a debugger whenever a package activates.
pub trait DebugSettings {
    /// `debugger` of `None` registers without a debugger command line, which
    /// still changes activation timing.
    fn enable_debugging(
        &self,
        package: &PackageFullName,
        debugger: Option<&str>,
    ) -> Result<(), RuntimeError>;

    fn disable_debugging(&self, package: &PackageFullName) -> Result<(), RuntimeError>;
}

/// Moves a process into a named job object owned by a parent harness.
pub trait JobAssigner {
    fn assign(&self, job_name: &str, pid: u32) -> Result<(), RuntimeError>;
}

/// Blocking facade over the platform services the launcher needs. Every
/// asynchronous platform operation is awaited to completion before the
/// method returns.
pub trait PlatformBackend: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// One-time per-process initialization (runtime apartment and the like).
    fn initialize(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Environment requirements that are not met. Empty means ready.
    fn check_prereqs(&self) -> Vec<MissingPrereq> {
        Vec::new()
    }

    /// Register the unpacked package described by `manifest_uri` in
    /// development mode and wait for deployment to finish.
    fn register_package(&self, manifest_uri: &str) -> Result<(), RuntimeError>;

    /// Full names of every installed package in the family (any version).
    fn find_packages(&self, family: &PackageFamilyName)
        -> Result<Vec<PackageFullName>, RuntimeError>;

    fn remove_package(&self, full_name: &PackageFullName) -> Result<(), RuntimeError>;

    /// Launch the application and return its process id.
    fn activate(
        &self,
        app: &AppUserModelId,
        arguments: &str,
        options: ActivateOptions,
    ) -> Result<u32, RuntimeError>;

    /// Open a handle to `pid` with query, synchronize, terminate and
    /// set-quota rights.
    fn open_process(&self, pid: u32) -> Result<OpenProcess, RuntimeError>;

    /// Create a debugger registration handle. Called lazily, at most once per run.
    fn debug_settings(&self) -> Result<Box<dyn DebugSettings>, RuntimeError>;

    /// Private storage folder of the package family (without the trailing `AC`).
    fn container_folder(&self, family: &PackageFamilyName) -> Result<PathBuf, RuntimeError>;

    /// Probe once for job-object support. `None` disables reassignment.
    fn probe_job_support(&self) -> Option<Box<dyn JobAssigner>> {
        None
    }
}

pub fn select_backend(
    name: &str,
    mock_scenario: Option<&Path>,
) -> Result<Box<dyn PlatformBackend>, RuntimeError> {
    match name {
        #[cfg(windows)]
        "windows" => Ok(Box::new(crate::win::WindowsBackend::new())),
        "mock" => {
            let scenario = match mock_scenario {
                Some(path) => crate::mock::MockScenario::load(path)?,
                None => crate::mock::MockScenario::default(),
            };
            Ok(Box::new(crate::mock::MockBackend::new(scenario)))
        }
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

/// `file:///` URI for an absolute manifest path, as the deployment API expects.
pub fn manifest_uri(path: &Path) -> String {
    let mut raw = path.to_string_lossy().replace('\\', "/");
    if let Some(stripped) = raw.strip_prefix("//?/") {
        raw = stripped.to_owned();
    }
    let mut uri = String::from("file:///");
    for ch in raw.trim_start_matches('/').chars() {
        match ch {
            ' ' => uri.push_str("%20"),
            '%' => uri.push_str("%25"),
            '#' => uri.push_str("%23"),
            _ => uri.push(ch),
        }
    }
    uri
}

/// Inverse of [`manifest_uri`].
pub fn manifest_path_from_uri(uri: &str) -> Result<PathBuf, RuntimeError> {
    let rest = uri
        .strip_prefix("file:///")
        .ok_or_else(|| RuntimeError::InvalidUri(uri.to_owned()))?;
    let decoded = rest
        .replace("%20", " ")
        .replace("%23", "#")
        .replace("%25", "%");
    // Drive-letter paths stay relative to the drive, everything else is rooted.
    let is_drive = decoded.as_bytes().get(1) == Some(&b':');
    if is_drive {
        Ok(PathBuf::from(decoded))
    } else {
        Ok(PathBuf::from(format!("/{decoded}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_mock_backend() {
        let backend = select_backend("mock", None).unwrap();
        assert_eq!(backend.name(), "mock");
        assert!(backend.available());
    }

    #[test]
    fn select_unknown_backend_fails() {
        assert!(matches!(
            select_backend("nonexistent", None),
            Err(RuntimeError::BackendUnavailable(_))
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn windows_backend_unavailable_elsewhere() {
        assert!(select_backend("windows", None).is_err());
    }

    #[test]
    fn manifest_uri_for_windows_path() {
        let uri = manifest_uri(Path::new(r"C:\Build Output\pkg\AppxManifest.xml"));
        assert_eq!(uri, "file:///C:/Build%20Output/pkg/AppxManifest.xml");
    }

    #[test]
    fn manifest_uri_strips_verbatim_prefix() {
        let uri = manifest_uri(Path::new(r"\\?\D:\pkg\AppxManifest.xml"));
        assert_eq!(uri, "file:///D:/pkg/AppxManifest.xml");
    }

    #[test]
    fn manifest_uri_roundtrips_unix_path() {
        let path = Path::new("/tmp/run 1/AppxManifest.xml");
        let uri = manifest_uri(path);
        assert_eq!(uri, "file:///tmp/run%201/AppxManifest.xml");
        assert_eq!(manifest_path_from_uri(&uri).unwrap(), path);
    }

    #[test]
    fn manifest_path_from_uri_rejects_other_schemes() {
        assert!(manifest_path_from_uri("http://example.com/AppxManifest.xml").is_err());
    }
}
