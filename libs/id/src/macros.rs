//! `define_id!` and the parser it expands to.

use crate::{IdError, Ulid};

/// Split `{prefix}_{ulid}` and check the prefix. Shared by every generated
/// ID type.
#[doc(hidden)]
pub fn parse_prefixed(input: &str, prefix: &'static str) -> Result<Ulid, IdError> {
    if input.is_empty() {
        return Err(IdError::Empty);
    }
    let (found, raw) = input
        .split_once('_')
        .ok_or_else(|| IdError::Malformed(input.to_string()))?;
    if found != prefix {
        return Err(IdError::WrongKind {
            expected: prefix,
            found: found.to_string(),
        });
    }
    Ulid::from_string(raw).map_err(|e| IdError::BadUlid {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Define a ULID-backed identifier rendered as `{prefix}_{ulid}`.
///
/// ```ignore
/// define_id!(InstanceId, "inst", "A simulated fleet instance.");
///
/// let id = InstanceId::new();
/// assert!(id.to_string().starts_with("inst_"));
/// ```
///
/// The generated type orders by creation time, serializes as its string
/// form, and refuses to parse an identifier of another kind.
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// A fresh identifier. Never equal to one issued before.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::macros::parse_prefixed(s, Self::PREFIX).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <std::borrow::Cow<'de, str> as serde::Deserialize>::deserialize(deserializer)?;
                Self::parse(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}
