//! Document identifiers.
//!
//! An [`Identifier`] is 12 opaque bytes laid out as:
//!
//! ```text
//! +-----------+-------------------+-----------+
//! | 0..4      | 4..9              | 9..12     |
//! | unix secs | process-unique    | counter   |
//! | (BE)      | random            | (BE)      |
//! +-----------+-------------------+-----------+
//! ```
//!
//! The layout matches the `ObjectId` format used by document stores, so values
//! convert losslessly to and from [`bson::oid::ObjectId`]. Every backend stores
//! the same bytes; relational tables keep the lowercase hex form.

use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, Ordering};

/// Number of raw bytes in an identifier.
pub const ID_LEN: usize = 12;

/// Number of characters in the hex form.
pub const HEX_LEN: usize = ID_LEN * 2;

const COUNTER_MASK: u32 = 0x00FF_FFFF;

/// Random bytes fixed for the lifetime of the process.
static PROCESS_UNIQUE: LazyLock<[u8; 5]> = LazyLock::new(|| {
    let seed = uuid::Uuid::new_v4();
    let mut out = [0u8; 5];
    out.copy_from_slice(&seed.as_bytes()[..5]);
    out
});

/// Counter seeded randomly so two processes started in the same second
/// do not walk the same sequence.
static COUNTER: LazyLock<AtomicU32> = LazyLock::new(|| {
    let seed = uuid::Uuid::new_v4();
    let b = seed.as_bytes();
    AtomicU32::new(u32::from_be_bytes([0, b[0], b[1], b[2]]))
});

/// A 12-byte document identifier with an embedded creation timestamp.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier([u8; ID_LEN]);

impl Identifier {
    /// Generates a fresh identifier stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_time(Utc::now())
    }

    fn with_time(at: DateTime<Utc>) -> Self {
        let count = COUNTER.fetch_add(1, Ordering::SeqCst) & COUNTER_MASK;
        let mut bytes = [0u8; ID_LEN];
        bytes[..4].copy_from_slice(&timestamp_bytes(at));
        bytes[4..9].copy_from_slice(&*PROCESS_UNIQUE);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    /// Builds the smallest identifier for the given creation time.
    ///
    /// Useful as a range bound: every identifier generated at or after `at`
    /// compares greater than or equal to it.
    #[must_use]
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        let mut bytes = [0u8; ID_LEN];
        bytes[..4].copy_from_slice(&timestamp_bytes(at));
        Self(bytes)
    }

    /// Wraps raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds an identifier from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] unless the slice is exactly 12 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidIdentifier(format!("expected {ID_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Returns `true` when the slice can be an identifier.
    #[must_use]
    pub const fn is_valid_slice(bytes: &[u8]) -> bool {
        bytes.len() == ID_LEN
    }

    /// Decodes a 24-character hex string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] when `s` is not exactly 24 hex
    /// characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != HEX_LEN {
            return Err(Error::InvalidIdentifier(format!(
                "'{s}' is not {HEX_LEN} hex characters"
            )));
        }
        let mut bytes = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::InvalidIdentifier(format!("'{s}': {e}")))?;
        Ok(Self(bytes))
    }

    /// Parses either the hex form or the display form `ObjectId("…")`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] if neither form matches.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix("ObjectId(\"")
            .and_then(|rest| rest.strip_suffix("\")"))
            .unwrap_or(trimmed);
        Self::from_hex(inner)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn bytes(&self) -> [u8; ID_LEN] {
        self.0
    }

    /// Returns the lowercase 24-character hex form.
    #[must_use]
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the backend-qualified display form, e.g. `ObjectId("…")`.
    #[must_use]
    pub fn to_display(&self) -> String {
        format!("ObjectId(\"{}\")", self.hex())
    }

    /// Returns the creation time embedded in the first four bytes.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        let secs = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        Utc.timestamp_opt(i64::from(secs), 0)
            .single()
            .unwrap_or_default()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn timestamp_bytes(at: DateTime<Utc>) -> [u8; 4] {
    // The on-disk format holds 32 unsigned bits of seconds.
    (at.timestamp().clamp(0, i64::from(u32::MAX)) as u32).to_be_bytes()
}

impl Default for Identifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display())
    }
}

impl FromStr for Identifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&[u8]> for Identifier {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::from_slice(bytes)
    }
}

impl From<Identifier> for bson::oid::ObjectId {
    fn from(id: Identifier) -> Self {
        Self::from_bytes(id.0)
    }
}

impl From<bson::oid::ObjectId> for Identifier {
    fn from(oid: bson::oid::ObjectId) -> Self {
        Self(oid.bytes())
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
