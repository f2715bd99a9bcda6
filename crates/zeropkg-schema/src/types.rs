//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings for backward compatibility.

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
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
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

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<$name> for String {
            fn eq(&self, other: &$name) -> bool {
                *self == other.0
            }
        }

        impl AsRef<std::path::Path> for $name {
            fn as_ref(&self) -> &std::path::Path {
                std::path::Path::new(&self.0)
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
    /// Unique package identifier as it appears in the ports tree and the database.
    PackageName
);

string_newtype!(
    /// Blake3 hex digest of an installed file's content.
    FileDigest
);

impl std::borrow::Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn package_name_display_and_as_ref() {
        let name = PackageName::new("zlib");
        assert_eq!(name.to_string(), "zlib");
        assert_eq!(name.as_str(), "zlib");
        assert_eq!(AsRef::<str>::as_ref(&name), "zlib");
    }

    #[test]
    fn package_name_serde_is_transparent() {
        let name = PackageName::new("glibc");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"glibc\"");
        let back: PackageName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }

    #[test]
    fn package_name_orders_lexically() {
        let mut names = vec![
            PackageName::from("zlib"),
            PackageName::from("bash"),
            PackageName::from("make"),
        ];
        names.sort();
        assert_eq!(names[0].as_str(), "bash");
        assert_eq!(names[2].as_str(), "zlib");
    }

    #[test]
    fn map_keyed_by_name_looks_up_by_str() {
        let mut map = BTreeMap::new();
        map.insert(PackageName::from("ncurses"), 1);
        assert_eq!(map.get("ncurses"), Some(&1));
    }

    #[test]
    fn file_digest_into_inner() {
        let d = FileDigest::new("abc".to_owned());
        assert_eq!(d.into_inner(), "abc");
    }
}
