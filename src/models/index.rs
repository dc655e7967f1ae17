//! Backend-neutral index descriptors.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordering or special kind of one index key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Ascending (`1`).
    Ascending,
    /// Descending (`-1`).
    Descending,
    /// Special index kind such as `text`, `hashed` or `2dsphere`.
    Special(String),
}

impl IndexKind {
    /// Returns the signed ordinal used by document stores, if any.
    #[must_use]
    pub const fn ordinal(&self) -> Option<i32> {
        match self {
            Self::Ascending => Some(1),
            Self::Descending => Some(-1),
            Self::Special(_) => None,
        }
    }

    /// Builds a kind from a signed ordinal; negative means descending.
    #[must_use]
    pub const fn from_ordinal(ordinal: i64) -> Self {
        if ordinal < 0 {
            Self::Descending
        } else {
            Self::Ascending
        }
    }

    fn name_part(&self) -> String {
        match self {
            Self::Ascending => "1".to_string(),
            Self::Descending => "-1".to_string(),
            Self::Special(kind) => kind.clone(),
        }
    }
}

/// A single field of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKey {
    /// Field name.
    pub field: String,
    /// Direction or special kind.
    pub kind: IndexKind,
}

impl IndexKey {
    /// Ascending key on `field`.
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: IndexKind::Ascending,
        }
    }

    /// Descending key on `field`.
    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: IndexKind::Descending,
        }
    }

    /// Special-kind key such as `text` on `field`.
    #[must_use]
    pub fn special(field: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind: IndexKind::Special(kind.into()),
        }
    }
}

/// Parses `"field"`, `"-field"` or `"$kind:field"`.
impl FromStr for IndexKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = if let Some(rest) = s.strip_prefix('$') {
            let (kind, field) = rest.split_once(':').ok_or_else(|| {
                Error::InvalidInput(format!("special index key '{s}' must be '$kind:field'"))
            })?;
            Self::special(field, kind)
        } else if let Some(field) = s.strip_prefix('-') {
            Self::desc(field)
        } else {
            Self::asc(s.strip_prefix('+').unwrap_or(s))
        };
        if key.field.is_empty() {
            return Err(Error::InvalidInput(format!("index key '{s}' has no field")));
        }
        Ok(key)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            IndexKind::Ascending => write!(f, "{}", self.field),
            IndexKind::Descending => write!(f, "-{}", self.field),
            IndexKind::Special(kind) => write!(f, "${kind}:{}", self.field),
        }
    }
}

/// A backend-neutral index specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name; generated from the keys when absent.
    pub name: Option<String>,
    /// Ordered keys.
    pub keys: Vec<IndexKey>,
    /// Build in the background where the backend supports it.
    pub background: bool,
    /// Expire documents this many seconds after the keyed timestamp.
    pub ttl_seconds: Option<u64>,
}

impl IndexDescriptor {
    /// Creates a descriptor from key strings such as `"name"` or `"-age"`.
    ///
    /// # Errors
    ///
    /// Returns an error if a key string cannot be parsed.
    pub fn from_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        let keys = keys
            .iter()
            .map(|k| k.as_ref().parse())
            .collect::<Result<Vec<IndexKey>>>()?;
        Ok(Self {
            keys,
            ..Self::default()
        })
    }

    /// Sets the index name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the TTL in seconds.
    #[must_use]
    pub const fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    /// Requests a background build.
    #[must_use]
    pub const fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Checks key and TTL constraints.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyIndexKeys`] when there are no keys
    /// - [`Error::ComposedTtlIndex`] when a TTL is set on more than one key
    pub fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            return Err(Error::EmptyIndexKeys);
        }
        if self.keys.len() > 1 && self.ttl_seconds.is_some() {
            return Err(Error::ComposedTtlIndex);
        }
        Ok(())
    }

    /// Returns the explicit name, or `field_dir[_field_dir…]` when none was set.
    #[must_use]
    pub fn resolved_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.keys
                .iter()
                .map(|k| format!("{}_{}", k.field, k.kind.name_part()))
                .collect::<Vec<_>>()
                .join("_")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("age", IndexKey::asc("age"); "ascending")]
    #[test_case("+age", IndexKey::asc("age"); "explicit plus")]
    #[test_case("-age", IndexKey::desc("age"); "descending")]
    #[test_case("$text:title", IndexKey::special("title", "text"); "special")]
    fn test_parse_index_key(input: &str, expected: IndexKey) {
        let key: IndexKey = input.parse().unwrap();
        assert_eq!(key, expected);
        if input.starts_with('+') {
            assert_eq!(key.to_string(), "age");
        } else {
            assert_eq!(key.to_string(), input);
        }
    }

    #[test]
    fn test_parse_rejects_empty_field() {
        assert!("-".parse::<IndexKey>().is_err());
        assert!("$text".parse::<IndexKey>().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            IndexDescriptor::default().validate(),
            Err(Error::EmptyIndexKeys)
        ));
        let composed = IndexDescriptor::from_keys(&["a", "b"]).unwrap().with_ttl(30);
        assert!(matches!(composed.validate(), Err(Error::ComposedTtlIndex)));
        let ttl = IndexDescriptor::from_keys(&["created_at"]).unwrap().with_ttl(30);
        assert!(ttl.validate().is_ok());
    }

    #[test]
    fn test_auto_naming() {
        let idx = IndexDescriptor::from_keys(&["name", "-age"]).unwrap();
        assert_eq!(idx.resolved_name(), "name_1_age_-1");
        let named = idx.with_name("by_name");
        assert_eq!(named.resolved_name(), "by_name");
        let text = IndexDescriptor::from_keys(&["$text:body"]).unwrap();
        assert_eq!(text.resolved_name(), "body_text");
    }

    #[test]
    fn test_ordinal_roundtrip() {
        assert_eq!(IndexKind::Ascending.ordinal(), Some(1));
        assert_eq!(IndexKind::from_ordinal(-1), IndexKind::Descending);
        assert_eq!(IndexKind::from_ordinal(1), IndexKind::Ascending);
        assert_eq!(IndexKind::Special("text".into()).ordinal(), None);
    }
}
