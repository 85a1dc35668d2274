use crate::CoreError;
use storelaunch_runtime::{DebugSettings, PlatformBackend};
use storelaunch_schema::PackageFullName;
use tracing::{debug, info};

/// Debugger registration for one package, for the life of one run.
///
/// The platform handle is created on first use and reused afterwards.
pub struct DebugSession<'a> {
    backend: &'a dyn PlatformBackend,
    package: PackageFullName,
    settings: Option<Box<dyn DebugSettings>>,
}

impl<'a> DebugSession<'a> {
    pub fn new(backend: &'a dyn PlatformBackend, package: PackageFullName) -> Self {
        Self {
            backend,
            package,
            settings: None,
        }
    }

    pub fn package(&self) -> &PackageFullName {
        &self.package
    }

    pub fn is_connected(&self) -> bool {
        self.settings.is_some()
    }

    fn settings(&mut self) -> Result<&dyn DebugSettings, CoreError> {
        let settings = match self.settings.take() {
            Some(existing) => existing,
            None => {
                debug!("creating debug settings handle");
                self.backend.debug_settings()?
            }
        };
        Ok(&**self.settings.insert(settings))
    }

    /// Register `debugger` to attach whenever the package activates. An empty
    /// or absent command line registers a null debugger, which still has to
    /// happen for activation to behave under test.
    pub fn enable(&mut self, debugger: Option<&str>) -> Result<(), CoreError> {
        let debugger = debugger.filter(|d| !d.is_empty());
        info!("Package ID is {}", self.package);
        let package = self.package.clone();
        self.settings()?.enable_debugging(&package, debugger)?;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), CoreError> {
        let package = self.package.clone();
        self.settings()?.disable_debugging(&package)?;
        Ok(())
    }
}
