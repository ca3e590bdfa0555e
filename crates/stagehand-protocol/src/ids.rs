//! Typed identifiers.
//!
//! Session identifiers are opaque strings (serde-transparent). Event ids are
//! stream-assigned sequence numbers and therefore a `u64` newtype.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Opaque identifier for one agent session. Every interface is keyed by it.
    SessionId
);

impl SessionId {
    /// A form of the id usable in file names and cluster resource names:
    /// lowercase ASCII alphanumerics and `-` only. A readable prefix is
    /// followed by a digest of the raw id, so distinct ids never share a
    /// slug. At most 40 characters.
    pub fn slug(&self) -> String {
        let mut readable: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        readable.truncate(SLUG_PREFIX_LEN);
        let readable = match readable.trim_matches('-') {
            "" => "session",
            trimmed => trimmed,
        };
        let digest = hex::encode(Sha256::digest(self.0.as_bytes()));
        format!("{readable}-{}", &digest[..SLUG_DIGEST_LEN])
    }
}

const SLUG_PREFIX_LEN: usize = 27;
const SLUG_DIGEST_LEN: usize = 12;

/// Stream-assigned event id. Strictly increasing and gap-free within one
/// stream; the first event of a stream has id 0.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl EventId {
    pub const ZERO: EventId = EventId(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> EventId {
        EventId(self.0 + 1)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
