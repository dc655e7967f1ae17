//! Record capability traits and the declared field mapping.
//!
//! Rows are plain serde types. Their derived `Serialize`/`Deserialize` impls
//! are the field-mapping table: [`to_dbm`] and [`from_dbm`] move values
//! between a record and the query model without reflection, and [`Schema`]
//! captures each field's value kind from the type's `Default` instance.

use super::dbm::{Dbm, Value, dbm_from_json, dbm_to_json};
use super::Identifier;
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Name of the identifier field on every backend.
pub const ID_FIELD: &str = "_id";

/// Identifier and table-name capabilities shared by all stored rows.
pub trait DbObject {
    /// Returns the row identifier, if assigned.
    fn id(&self) -> Option<Identifier>;

    /// Assigns the row identifier.
    fn set_id(&mut self, id: Identifier);

    /// Returns the declared collection or table name.
    fn table_name(&self) -> Option<&str> {
        None
    }
}

/// A row type that can be stored by any backend.
///
/// Implementors serialize their identifier under [`ID_FIELD`], typically with
/// `#[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]`.
pub trait Record: DbObject + Serialize + DeserializeOwned + Default + Send {}

impl<T> Record for T where T: DbObject + Serialize + DeserializeOwned + Default + Send {}

/// Serializes a record into a query-model row.
///
/// # Errors
///
/// Returns an error if the record does not serialize to a JSON object.
pub fn to_dbm<T: Serialize>(row: &T) -> Result<Dbm> {
    let json = serde_json::to_value(row)?;
    let mut dbm = dbm_from_json(json)?;
    // Identifiers serialize as hex strings; restore the typed form so backends
    // can route them natively.
    if let Some(Value::String(hex)) = dbm.get(ID_FIELD) {
        let id = Identifier::from_hex(hex)?;
        dbm.insert(ID_FIELD.to_string(), Value::Id(id));
    }
    Ok(dbm)
}

/// Deserializes a query-model row into a record.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the row does not fit the record type.
pub fn from_dbm<T: DeserializeOwned>(row: &Dbm) -> Result<T> {
    serde_json::from_value(dbm_to_json(row))
        .map_err(|e| Error::InvalidInput(format!("cannot map row into record: {e}")))
}

/// Storage shape of a single field, taken from the record's default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Stored as-is (text, numbers, null).
    Scalar,
    /// Stored as an integer, read back as a boolean.
    Bool,
    /// Stored as JSON text, read back as a list or map.
    Json,
}

/// Declared fields of a record type, in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<(String, FieldKind)>,
}

impl Schema {
    /// Derives the schema of `T` from `T::default()`.
    ///
    /// The identifier column is always first.
    ///
    /// # Errors
    ///
    /// Returns an error if the default value does not serialize to an object.
    pub fn of<T: Record>() -> Result<Self> {
        let sample = serde_json::to_value(T::default())?;
        let serde_json::Value::Object(map) = sample else {
            return Err(Error::InvalidInput(
                "record must serialize to an object".to_string(),
            ));
        };
        let mut fields = vec![(ID_FIELD.to_string(), FieldKind::Scalar)];
        for (name, value) in map {
            if name == ID_FIELD {
                continue;
            }
            let kind = match value {
                serde_json::Value::Bool(_) => FieldKind::Bool,
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => FieldKind::Json,
                _ => FieldKind::Scalar,
            };
            fields.push((name, kind));
        }
        Ok(Self { fields })
    }

    /// Returns the field names in column order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Returns the kind of `field`, defaulting to [`FieldKind::Scalar`].
    #[must_use]
    pub fn kind(&self, field: &str) -> FieldKind {
        self.fields
            .iter()
            .find(|(n, _)| n == field)
            .map_or(FieldKind::Scalar, |(_, k)| *k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Person {
        #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
        id: Option<Identifier>,
        name: String,
        age: i64,
        active: bool,
        tags: Vec<String>,
    }

    impl DbObject for Person {
        fn id(&self) -> Option<Identifier> {
            self.id
        }

        fn set_id(&mut self, id: Identifier) {
            self.id = Some(id);
        }

        fn table_name(&self) -> Option<&str> {
            Some("people")
        }
    }

    #[test]
    fn test_to_dbm_restores_typed_identifier() {
        let id = Identifier::new();
        let p = Person {
            id: Some(id),
            name: "Jane".into(),
            age: 8,
            ..Person::default()
        };
        let row = to_dbm(&p).unwrap();
        assert_eq!(row[ID_FIELD], Value::Id(id));
        assert_eq!(row["name"], Value::from("Jane"));
        assert_eq!(row["age"], Value::Int(8));
    }

    #[test]
    fn test_to_dbm_without_identifier() {
        let row = to_dbm(&Person::default()).unwrap();
        assert!(!row.contains_key(ID_FIELD));
    }

    #[test]
    fn test_from_dbm_roundtrip() {
        let p = Person {
            id: Some(Identifier::new()),
            name: "Ann".into(),
            age: 40,
            active: true,
            tags: vec!["x".into()],
        };
        let back: Person = from_dbm(&to_dbm(&p).unwrap()).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_from_dbm_type_mismatch() {
        let mut row = to_dbm(&Person::default()).unwrap();
        row.insert("age".into(), Value::from("old"));
        assert!(matches!(from_dbm::<Person>(&row), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_schema_of() {
        let schema = Schema::of::<Person>().unwrap();
        let names: Vec<&str> = schema.names().collect();
        assert_eq!(names[0], ID_FIELD);
        assert!(names.contains(&"name"));
        assert_eq!(schema.kind("active"), FieldKind::Bool);
        assert_eq!(schema.kind("tags"), FieldKind::Json);
        assert_eq!(schema.kind("age"), FieldKind::Scalar);
        assert_eq!(schema.kind("missing"), FieldKind::Scalar);
    }
}
