//! 128-bit opaque tags: file ETags and server identifiers.
//!
//! Ordering is defined explicitly as an unsigned big-endian byte-wise
//! comparison. ETags are allocated from a monotonic counter, so this order is
//! also allocation order.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Compare two tags as unsigned big-endian integers.
pub fn compare_unsigned(a: &[u8; 16], b: &[u8; 16]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn parse_hex16(s: &str) -> Result<[u8; 16], SyncError> {
    let trimmed = s.trim().trim_matches('"');
    let cleaned: String = trimmed.chars().filter(|c| *c != '-').collect();
    let bytes = hex::decode(&cleaned)
        .map_err(|e| SyncError::Protocol(format!("Invalid 128-bit tag '{}': {}", s, e)))?;
    bytes
        .try_into()
        .map_err(|_| SyncError::Protocol(format!("Invalid 128-bit tag length: '{}'", s)))
}

macro_rules! tag_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name([u8; 16]);

        impl $name {
            pub const EMPTY: $name = $name([0u8; 16]);

            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0 == [0u8; 16]
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                compare_unsigned(&self.0, &other.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex16(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

tag_type!(
    /// Version tag of a file's current state. Changes on every content or
    /// metadata write.
    Etag
);

tag_type!(
    /// Identity of a storage server instance.
    ServerId
);

impl Etag {
    /// Tag for the n-th allocation of a storage's counter.
    pub fn from_counter(counter: u128) -> Self {
        Self(counter.to_be_bytes())
    }

    pub fn counter(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }
}

impl ServerId {
    pub fn generate() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }
}
