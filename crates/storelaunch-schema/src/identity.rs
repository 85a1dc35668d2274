use crate::manifest::{parse_manifest_file, ManifestError, ManifestIdentity, PackageManifest};
use crate::types::{AppUserModelId, PackageFamilyName, PackageFullName};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("cannot resolve manifest path '{path}': {source}")]
    Path {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("manifest declares no applications; cannot choose a default app")]
    NoApplications,
    #[error("manifest declares {0} applications; the default app is ambiguous (pass an explicit app id)")]
    AmbiguousApplications(usize),
    #[error("application id must not be empty")]
    EmptyAppId,
}

/// Everything needed to install, launch and remove one application.
///
/// Built once per run from the manifest and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageIdentity {
    manifest_path: PathBuf,
    full_name: PackageFullName,
    family_name: PackageFamilyName,
    app_user_model_id: AppUserModelId,
}

impl PackageIdentity {
    /// Read the manifest at `manifest_path` and resolve the activation id.
    ///
    /// The path is made absolute before anything else so a relative path can
    /// never bind to a different working directory later in the run. With no
    /// `app_id` the manifest must declare exactly one application.
    pub fn resolve(manifest_path: &Path, app_id: Option<&str>) -> Result<Self, IdentityError> {
        let absolute = std::path::absolute(manifest_path).map_err(|source| IdentityError::Path {
            path: manifest_path.to_path_buf(),
            source,
        })?;
        let manifest = parse_manifest_file(&absolute)?;
        Self::from_manifest(absolute, &manifest, app_id)
    }

    pub fn from_manifest(
        manifest_path: PathBuf,
        manifest: &PackageManifest,
        app_id: Option<&str>,
    ) -> Result<Self, IdentityError> {
        let full_name = full_name(&manifest.identity);
        let family_name = family_name(&manifest.identity.name, &manifest.identity.publisher);

        let app_user_model_id = match app_id {
            Some("") => return Err(IdentityError::EmptyAppId),
            Some(explicit) => AppUserModelId::new(format!("{family_name}!{explicit}")),
            None => match manifest.applications.as_slice() {
                [] => return Err(IdentityError::NoApplications),
                [only] => AppUserModelId::new(format!("{family_name}!{}", only.id)),
                many => return Err(IdentityError::AmbiguousApplications(many.len())),
            },
        };

        Ok(Self {
            manifest_path,
            full_name,
            family_name,
            app_user_model_id,
        })
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Directory holding the manifest; a process launched from this package
    /// has its image here.
    pub fn manifest_dir(&self) -> &Path {
        self.manifest_path.parent().unwrap_or(Path::new(""))
    }

    pub fn full_name(&self) -> &PackageFullName {
        &self.full_name
    }

    pub fn family_name(&self) -> &PackageFamilyName {
        &self.family_name
    }

    pub fn app_user_model_id(&self) -> &AppUserModelId {
        &self.app_user_model_id
    }
}

const PUBLISHER_ID_ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

/// 13-character publisher id: the first 64 bits of SHA-256 over the UTF-16LE
/// publisher string, padded to 65 bits and base32 encoded.
pub fn publisher_id(publisher: &str) -> String {
    let mut hasher = Sha256::new();
    for unit in publisher.encode_utf16() {
        hasher.update(unit.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let bits = u128::from(u64::from_be_bytes(prefix)) << 1;

    (0..13)
        .rev()
        .map(|group| char::from(PUBLISHER_ID_ALPHABET[((bits >> (group * 5)) & 0x1f) as usize]))
        .collect()
}

pub fn family_name(name: &str, publisher: &str) -> PackageFamilyName {
    PackageFamilyName::new(format!("{name}_{}", publisher_id(publisher)))
}

pub fn full_name(identity: &ManifestIdentity) -> PackageFullName {
    let arch = identity
        .processor_architecture
        .as_deref()
        .unwrap_or("neutral")
        .to_ascii_lowercase();
    PackageFullName::new(format!(
        "{}_{}_{}_{}_{}",
        identity.name,
        identity.version,
        arch,
        identity.resource_id.as_deref().unwrap_or(""),
        publisher_id(&identity.publisher)
    ))
}
