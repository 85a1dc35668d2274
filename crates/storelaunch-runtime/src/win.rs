//! Windows backend: deployment through the WinRT package manager, activation
//! through the COM activation manager, and plain Win32 for process handles,
//! app container folders and job objects.

use crate::backend::{
    ActivateOptions, DebugSettings, JobAssigner, OpenProcess, PlatformBackend, ProcessControl,
    ProcessWait,
};
use crate::prereq::{MissingPrereq, DESKTOP_COMPOSITION};
use crate::RuntimeError;
use std::path::PathBuf;
use std::time::Duration;
use storelaunch_schema::{AppUserModelId, PackageFamilyName, PackageFullName};
use tracing::{debug, warn};
use windows::core::{Error as WinError, HSTRING, PCWSTR, PWSTR};
use windows::Foundation::Uri;
use windows::Management::Deployment::{DeploymentOptions, PackageManager};
use windows::Win32::Foundation::{
    CloseHandle, LocalFree, ERROR_INVALID_PARAMETER, HANDLE, HLOCAL, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::Graphics::Dwm::DwmIsCompositionEnabled;
use windows::Win32::Security::Authorization::ConvertSidToStringSidW;
use windows::Win32::Security::FreeSid;
use windows::Win32::Security::Isolation::{
    DeriveAppContainerSidFromAppContainerName, GetAppContainerFolderPath,
};
use windows::Win32::System::Com::{CoCreateInstance, CoTaskMemFree, CLSCTX_ALL, CLSCTX_LOCAL_SERVER};
use windows::Win32::System::JobObjects::{AssignProcessToJobObject, OpenJobObjectW};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess as Win32OpenProcess, QueryFullProcessImageNameW,
    TerminateProcess, WaitForSingleObjectEx, INFINITE, PROCESS_NAME_WIN32,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SET_QUOTA, PROCESS_SYNCHRONIZE, PROCESS_TERMINATE,
};
use windows::Win32::System::WinRT::{RoInitialize, RO_INIT_MULTITHREADED};
use windows::Win32::UI::Shell::{
    ApplicationActivationManager, IApplicationActivationManager, IPackageDebugSettings,
    PackageDebugSettings, AO_NONE, AO_NOSPLASHSCREEN,
};

const STILL_ACTIVE: u32 = 259;
const JOB_OBJECT_ASSIGN_PROCESS: u32 = 0x0001;

fn platform_error(operation: &'static str) -> impl FnOnce(WinError) -> RuntimeError {
    move |e| RuntimeError::platform(operation, e.code().0, e.message())
}

/// Closes the wrapped handle on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: the handle was returned by a successful open call and is
        // closed exactly once, here.
        if let Err(e) = unsafe { CloseHandle(self.0) } {
            debug!("failed to close handle: {e}");
        }
    }
}

#[derive(Debug, Default)]
pub struct WindowsBackend;

impl WindowsBackend {
    pub fn new() -> Self {
        Self
    }

    fn package_manager() -> Result<PackageManager, RuntimeError> {
        PackageManager::new().map_err(platform_error("create package manager"))
    }
}

impl PlatformBackend for WindowsBackend {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn available(&self) -> bool {
        true
    }

    #[allow(unsafe_code)]
    fn initialize(&self) -> Result<(), RuntimeError> {
        // SAFETY: initializes the calling thread's apartment; a repeated call
        // on the same thread returns S_FALSE, which maps to Ok.
        unsafe { RoInitialize(RO_INIT_MULTITHREADED) }
            .map_err(platform_error("initialize Windows Runtime"))
    }

    #[allow(unsafe_code)]
    fn check_prereqs(&self) -> Vec<MissingPrereq> {
        // SAFETY: no arguments, reads global compositor state.
        match unsafe { DwmIsCompositionEnabled() } {
            Ok(enabled) if enabled.as_bool() => Vec::new(),
            Ok(_) => vec![DESKTOP_COMPOSITION],
            Err(e) => {
                warn!("cannot query desktop composition state: {e}");
                vec![DESKTOP_COMPOSITION]
            }
        }
    }

    fn register_package(&self, manifest_uri: &str) -> Result<(), RuntimeError> {
        let manager = Self::package_manager()?;
        let uri = Uri::CreateUri(&HSTRING::from(manifest_uri))
            .map_err(|_| RuntimeError::InvalidUri(manifest_uri.to_owned()))?;
        let result = manager
            .RegisterPackageAsync(&uri, None, DeploymentOptions::DevelopmentMode)
            .and_then(|op| op.get())
            .map_err(platform_error("register package"))?;

        let extended = result
            .ExtendedErrorCode()
            .map_err(platform_error("register package"))?;
        if extended.is_err() {
            let text = result
                .ErrorText()
                .map(|t| t.to_string_lossy())
                .unwrap_or_default();
            return Err(RuntimeError::platform("register package", extended.0, text));
        }
        Ok(())
    }

    fn find_packages(
        &self,
        family: &PackageFamilyName,
    ) -> Result<Vec<PackageFullName>, RuntimeError> {
        let manager = Self::package_manager()?;
        // An empty user SID means the current user.
        let packages = manager
            .FindPackagesByUserSecurityIdPackageFamilyName(
                &HSTRING::new(),
                &HSTRING::from(family.as_str()),
            )
            .map_err(platform_error("find packages"))?;

        let mut names = Vec::new();
        for package in packages {
            let full = package
                .Id()
                .and_then(|id| id.FullName())
                .map_err(platform_error("read package id"))?;
            names.push(PackageFullName::new(full.to_string_lossy()));
        }
        Ok(names)
    }

    fn remove_package(&self, full_name: &PackageFullName) -> Result<(), RuntimeError> {
        let manager = Self::package_manager()?;
        let result = manager
            .RemovePackageAsync(&HSTRING::from(full_name.as_str()))
            .and_then(|op| op.get())
            .map_err(platform_error("remove package"))?;

        let extended = result
            .ExtendedErrorCode()
            .map_err(platform_error("remove package"))?;
        if extended.is_err() {
            let text = result
                .ErrorText()
                .map(|t| t.to_string_lossy())
                .unwrap_or_default();
            return Err(RuntimeError::platform("remove package", extended.0, text));
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn activate(
        &self,
        app: &AppUserModelId,
        arguments: &str,
        options: ActivateOptions,
    ) -> Result<u32, RuntimeError> {
        let flags = if options.no_splash_screen {
            AO_NOSPLASHSCREEN
        } else {
            AO_NONE
        };
        // SAFETY: COM is initialized by `initialize`; the HSTRING arguments
        // outlive the call.
        unsafe {
            let manager: IApplicationActivationManager =
                CoCreateInstance(&ApplicationActivationManager, None, CLSCTX_LOCAL_SERVER)
                    .map_err(platform_error("create activation manager"))?;
            manager
                .ActivateApplication(
                    &HSTRING::from(app.as_str()),
                    &HSTRING::from(arguments),
                    flags,
                )
                .map_err(platform_error("activate application"))
        }
    }

    #[allow(unsafe_code)]
    fn open_process(&self, pid: u32) -> Result<OpenProcess, RuntimeError> {
        let access = PROCESS_QUERY_LIMITED_INFORMATION
            | PROCESS_SYNCHRONIZE
            | PROCESS_TERMINATE
            | PROCESS_SET_QUOTA;
        // SAFETY: plain handle request; the result is owned by OwnedHandle.
        match unsafe { Win32OpenProcess(access, false, pid) } {
            Ok(handle) => Ok(OpenProcess::Opened(Box::new(WindowsProcess {
                pid,
                handle: OwnedHandle(handle),
            }))),
            Err(e) if e.code() == ERROR_INVALID_PARAMETER.to_hresult() => {
                Ok(OpenProcess::AlreadyExited)
            }
            Err(e) => Err(platform_error("open process")(e)),
        }
    }

    #[allow(unsafe_code)]
    fn debug_settings(&self) -> Result<Box<dyn DebugSettings>, RuntimeError> {
        // SAFETY: in-process COM object creation on an initialized apartment.
        let settings: IPackageDebugSettings =
            unsafe { CoCreateInstance(&PackageDebugSettings, None, CLSCTX_ALL) }
                .map_err(platform_error("create package debug settings"))?;
        Ok(Box::new(WindowsDebugSettings { settings }))
    }

    #[allow(unsafe_code)]
    fn container_folder(&self, family: &PackageFamilyName) -> Result<PathBuf, RuntimeError> {
        let operation = "resolve container folder";
        // SAFETY: every pointer returned here is freed with the allocator
        // that produced it before leaving the block.
        let folder = unsafe {
            let sid = DeriveAppContainerSidFromAppContainerName(&HSTRING::from(family.as_str()))
                .map_err(platform_error(operation))?;
            let mut sid_string = PWSTR::null();
            let converted = ConvertSidToStringSidW(sid, &mut sid_string);
            FreeSid(sid);
            converted.map_err(platform_error(operation))?;

            let path = GetAppContainerFolderPath(PCWSTR(sid_string.0));
            let _ = LocalFree(HLOCAL(sid_string.0.cast()));
            let path = path.map_err(platform_error(operation))?;
            let text = path.to_string();
            CoTaskMemFree(Some(path.0 as *const _));
            text.map_err(|e| RuntimeError::platform(operation, crate::E_FAIL, e.to_string()))?
        };

        // The platform reports `<container>\AC`; artifacts live relative to the container.
        let trimmed = folder
            .strip_suffix("\\AC")
            .or_else(|| folder.strip_suffix("\\ac"))
            .unwrap_or(&folder);
        Ok(PathBuf::from(trimmed))
    }

    #[allow(unsafe_code)]
    fn probe_job_support(&self) -> Option<Box<dyn JobAssigner>> {
        // SAFETY: looks up an export in an already loaded system module.
        let supported = unsafe {
            GetModuleHandleW(windows::core::w!("kernel32.dll"))
                .map(|module| {
                    GetProcAddress(module, windows::core::s!("AssignProcessToJobObject")).is_some()
                })
                .unwrap_or(false)
        };
        if supported {
            Some(Box::new(WindowsJobAssigner))
        } else {
            debug!("job objects unavailable; reassignment disabled");
            None
        }
    }
}

struct WindowsProcess {
    pid: u32,
    handle: OwnedHandle,
}

impl ProcessControl for WindowsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    #[allow(unsafe_code)]
    fn wait(&self, timeout: Option<Duration>) -> Result<ProcessWait, RuntimeError> {
        let millis = timeout.map_or(INFINITE, |t| {
            u32::try_from(t.as_millis()).unwrap_or(INFINITE - 1)
        });
        // SAFETY: the handle is open with SYNCHRONIZE access for our lifetime.
        let event = unsafe { WaitForSingleObjectEx(self.handle.0, millis, false) };
        match event {
            WAIT_OBJECT_0 => Ok(ProcessWait::Exited),
            WAIT_TIMEOUT => Ok(ProcessWait::TimedOut),
            other => {
                debug!("unexpected wait result {:#x}", other.0);
                Err(platform_error("wait for process")(WinError::from_win32()))
            }
        }
    }

    #[allow(unsafe_code)]
    fn terminate(&self, exit_code: u32) -> Result<(), RuntimeError> {
        // SAFETY: the handle carries PROCESS_TERMINATE.
        unsafe { TerminateProcess(self.handle.0, exit_code) }
            .map_err(platform_error("terminate process"))
    }

    #[allow(unsafe_code)]
    fn exit_code(&self) -> Result<Option<u32>, RuntimeError> {
        let mut code = 0u32;
        // SAFETY: `code` is a valid out pointer for the duration of the call.
        unsafe { GetExitCodeProcess(self.handle.0, &mut code) }
            .map_err(platform_error("read exit code"))?;
        if code == STILL_ACTIVE {
            // STILL_ACTIVE is also a legal exit code; only trust it once the
            // handle is signaled.
            if self.wait(Some(Duration::ZERO))? == ProcessWait::TimedOut {
                return Ok(None);
            }
        }
        Ok(Some(code))
    }

    #[allow(unsafe_code)]
    fn image_path(&self) -> Result<PathBuf, RuntimeError> {
        let mut buffer = vec![0u16; 32_768];
        let mut len = buffer.len() as u32;
        // SAFETY: `buffer` holds `len` u16s and outlives the call.
        unsafe {
            QueryFullProcessImageNameW(
                self.handle.0,
                PROCESS_NAME_WIN32,
                PWSTR(buffer.as_mut_ptr()),
                &mut len,
            )
        }
        .map_err(platform_error("query process image"))?;
        Ok(PathBuf::from(String::from_utf16_lossy(
            &buffer[..len as usize],
        )))
    }
}

struct WindowsDebugSettings {
    settings: IPackageDebugSettings,
}

impl DebugSettings for WindowsDebugSettings {
    #[allow(unsafe_code)]
    fn enable_debugging(
        &self,
        package: &PackageFullName,
        debugger: Option<&str>,
    ) -> Result<(), RuntimeError> {
        let package = HSTRING::from(package.as_str());
        let debugger = debugger.map(HSTRING::from);
        let debugger_ptr = debugger.as_ref().map_or(PCWSTR::null(), |d| PCWSTR(d.as_ptr()));
        // SAFETY: both strings outlive the call; a null debugger is accepted.
        unsafe {
            self.settings
                .EnableDebugging(&package, debugger_ptr, PCWSTR::null())
        }
        .map_err(platform_error("enable debugging"))
    }

    #[allow(unsafe_code)]
    fn disable_debugging(&self, package: &PackageFullName) -> Result<(), RuntimeError> {
        // SAFETY: the HSTRING outlives the call.
        unsafe {
            self.settings
                .DisableDebugging(&HSTRING::from(package.as_str()))
        }
        .map_err(platform_error("disable debugging"))
    }
}

struct WindowsJobAssigner;

impl JobAssigner for WindowsJobAssigner {
    #[allow(unsafe_code)]
    fn assign(&self, job_name: &str, pid: u32) -> Result<(), RuntimeError> {
        // SAFETY: both handles are owned and closed by OwnedHandle.
        unsafe {
            let job = OwnedHandle(
                OpenJobObjectW(JOB_OBJECT_ASSIGN_PROCESS, false, &HSTRING::from(job_name))
                    .map_err(platform_error("open job object"))?,
            );
            let process = OwnedHandle(
                Win32OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, false, pid)
                    .map_err(platform_error("open process for job"))?,
            );
            AssignProcessToJobObject(job.0, process.0)
                .map_err(platform_error("assign process to job"))
        }
    }
}
