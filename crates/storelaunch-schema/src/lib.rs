//! Package manifest reading and identity resolution for storelaunch.
//!
//! This crate defines the schema layer: a tolerant reader for
//! `AppxManifest.xml` (`PackageManifest`), the derivation of package full and
//! family names from a manifest identity, and `PackageIdentity`, which turns a
//! manifest plus an optional application id into the activation identifier
//! used to launch the app.

pub mod identity;
pub mod manifest;
pub mod types;

pub use identity::{family_name, full_name, publisher_id, IdentityError, PackageIdentity};
pub use manifest::{
    parse_manifest_file, parse_manifest_str, ManifestApplication, ManifestError,
    ManifestIdentity, PackageManifest,
};
pub use types::{AppUserModelId, PackageFamilyName, PackageFullName};
