//! The backend-neutral query model.
//!
//! A [`Dbm`] maps field names to [`Value`]s. The same map is used for filters,
//! update documents and whole rows. Nested maps whose keys start with `$` are
//! operator expressions; lists mean "any of" unless they sit under a logical
//! operator.

use super::Identifier;
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

/// A backend-neutral query, update or row.
pub type Dbm = BTreeMap<String, Value>;

/// A single value inside a [`Dbm`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent or SQL `NULL`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Document identifier.
    Id(Identifier),
    /// UTC timestamp.
    Time(DateTime<Utc>),
    /// Ordered list.
    List(Vec<Self>),
    /// Nested map: an operator expression or an embedded document.
    Doc(Dbm),
}

impl Value {
    /// Returns the string slice if this is a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is an `Int`.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the nested map if this is a `Doc`.
    #[must_use]
    pub const fn as_doc(&self) -> Option<&Dbm> {
        match self {
            Self::Doc(d) => Some(d),
            _ => None,
        }
    }

    /// Returns `true` for `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns `true` when this is a map whose keys are all operators.
    #[must_use]
    pub fn is_operator_expr(&self) -> bool {
        match self {
            Self::Doc(d) => !d.is_empty() && d.keys().all(|k| k.starts_with('$')),
            _ => false,
        }
    }

    /// Interprets the value as an identifier.
    ///
    /// Accepts `Id` values and strings in hex or display form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] for anything else.
    pub fn to_identifier(&self) -> Result<Identifier> {
        match self {
            Self::Id(id) => Ok(*id),
            Self::String(s) => Identifier::parse(s),
            other => Err(Error::InvalidIdentifier(format!(
                "{other:?} is not an identifier"
            ))),
        }
    }

    /// Converts to a JSON value.
    ///
    /// Identifiers become hex strings and timestamps RFC 3339 strings, matching
    /// how records serialize them.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Id(id) => serde_json::Value::String(id.hex()),
            Self::Time(t) => {
                serde_json::Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            },
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Doc(d) => serde_json::Value::Object(
                d.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Converts from a JSON value.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || n.as_f64().map_or(Self::Null, Self::Float),
                Self::Int,
            ),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            },
            serde_json::Value::Object(map) => Self::Doc(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Converts a JSON object into a [`Dbm`].
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `value` is not an object.
pub fn dbm_from_json(value: serde_json::Value) -> Result<Dbm> {
    match Value::from_json(value) {
        Value::Doc(d) => Ok(d),
        other => Err(Error::InvalidInput(format!(
            "expected an object, got {other:?}"
        ))),
    }
}

/// Converts a [`Dbm`] into a JSON object.
#[must_use]
pub fn dbm_to_json(dbm: &Dbm) -> serde_json::Value {
    serde_json::Value::Object(dbm.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Identifier> for Value {
    fn from(id: Identifier) -> Self {
        Self::Id(id)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Time(t)
    }
}

impl From<Dbm> for Value {
    fn from(d: Dbm) -> Self {
        Self::Doc(d)
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

/// Builds a [`Dbm`] from `key => value` pairs.
///
/// ```
/// use polystore::{dbm, Value};
///
/// let q = dbm! { "name" => "Jane", "age" => dbm! { "$gte" => 8 } };
/// assert_eq!(q["name"], Value::from("Jane"));
/// ```
#[macro_export]
macro_rules! dbm {
    () => {
        $crate::Dbm::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Dbm::new();
        $(
            map.insert(::std::string::String::from($key), $crate::Value::from($value));
        )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbm;
    use serde_json::json;

    #[test]
    fn test_dbm_macro_builds_nested_maps() {
        let q = dbm! {
            "name" => "Jane",
            "age" => dbm! { "$gte" => 8, "$lt" => 18 },
            "tags" => vec!["a", "b"],
        };
        assert_eq!(q.len(), 3);
        assert!(q["age"].is_operator_expr());
        assert!(!q["name"].is_operator_expr());
        assert_eq!(
            q["tags"],
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_embedded_document_is_not_operator_expr() {
        let v = Value::Doc(dbm! { "city" => "Oslo" });
        assert!(!v.is_operator_expr());
        assert!(!Value::Doc(Dbm::new()).is_operator_expr());
    }

    #[test]
    fn test_json_conversion() {
        let id = Identifier::from_hex("507f1f77bcf86cd799439011").unwrap();
        let row = dbm! { "_id" => id, "n" => 1, "f" => 1.5, "ok" => true, "none" => Value::Null };
        let json = dbm_to_json(&row);
        assert_eq!(
            json,
            json!({"_id": "507f1f77bcf86cd799439011", "n": 1, "f": 1.5, "ok": true, "none": null})
        );

        let back = dbm_from_json(json).unwrap();
        assert_eq!(back["_id"], Value::from("507f1f77bcf86cd799439011"));
        assert_eq!(back["n"], Value::Int(1));
        assert_eq!(back["f"], Value::Float(1.5));
    }

    #[test]
    fn test_dbm_from_json_rejects_non_object() {
        assert!(matches!(dbm_from_json(json!([1, 2])), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_to_identifier() {
        let id = Identifier::new();
        assert_eq!(Value::Id(id).to_identifier().unwrap(), id);
        assert_eq!(Value::String(id.hex()).to_identifier().unwrap(), id);
        assert!(Value::Int(3).to_identifier().is_err());
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::from("x"));
    }
}
