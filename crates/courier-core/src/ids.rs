//! Branded ID newtypes and correlation tokens.
//!
//! Channel identities are strings supplied by the host (or UUID v7 when the
//! broker has to mint one). Owner ids are the logical grouping key many
//! channels can share. Tokens are plain `u64` values that travel across
//! context boundaries unchanged.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
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

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identity of a live channel.
    ChannelId
}

impl ChannelId {
    /// Mint a fresh identity (UUID v7, time-ordered).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

/// Logical owner of one or more channels (e.g. a browser tab).
///
/// Peers send owner ids either as JSON numbers or strings. Both forms are
/// normalized to the decimal string of the integer when the value parses as
/// one, so `5`, `"5"` and `"05"` all name the same owner.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Owner id used for contexts that do not belong to any real owner.
    pub const BEHIND_THE_SCENE: &'static str = "-1";

    /// Build an owner id, normalizing integer-looking strings.
    #[must_use]
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().trim();
        match raw.parse::<i64>() {
            Ok(n) => Self(n.to_string()),
            Err(_) => Self(raw.to_owned()),
        }
    }

    /// Owner id that never matches a real owner.
    #[must_use]
    pub fn behind_the_scene() -> Self {
        Self(Self::BEHIND_THE_SCENE.to_owned())
    }

    /// Whether this id denotes "no real owner".
    #[must_use]
    pub fn is_behind_the_scene(&self) -> bool {
        self.0 == Self::BEHIND_THE_SCENE
    }

    /// Return the normalized string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for OwnerId {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for OwnerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Self::from(n),
            Raw::Str(s) => Self::new(s),
        })
    }
}

macro_rules! token {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw token value.
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw token value.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

token! {
    /// Token chosen by a peer for one of its own requests (`auxProcessId`).
    ///
    /// Its presence means the peer wants a reply; the broker echoes it back
    /// unchanged on the reply envelope.
    OriginToken
}

token! {
    /// Token issued by the broker for a relayed request (`mainProcessId`).
    CorrelationToken
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
