//! Newtype wrappers for package identifiers, so a family name can never be
//! passed where a full name is expected.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// `Name_Version_Architecture_ResourceId_PublisherId`, unique per installed package.
    PackageFullName
);

string_newtype!(
    /// `Name_PublisherId`, shared by every version of a package.
    PackageFamilyName
);

string_newtype!(
    /// Activation identifier: `<family name>!<application id>`.
    AppUserModelId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_name_display_and_as_ref() {
        let family = PackageFamilyName::new("Contoso.App_h91ms92gdsmmt");
        assert_eq!(family.to_string(), "Contoso.App_h91ms92gdsmmt");
        assert_eq!(AsRef::<str>::as_ref(&family), "Contoso.App_h91ms92gdsmmt");
        assert_eq!(family, "Contoso.App_h91ms92gdsmmt");
    }

    #[test]
    fn aumid_serializes_as_plain_string() {
        let id = AppUserModelId::new("Fam_x!App");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"Fam_x!App\"");
        let back: AppUserModelId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn full_name_into_inner() {
        let full = PackageFullName::from(String::from("A_1.0.0.0_x64__abc"));
        assert_eq!(full.into_inner(), "A_1.0.0.0_x64__abc");
    }
}
