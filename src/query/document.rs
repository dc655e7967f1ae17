//! Document-store dialect.
//!
//! Compiles the query model into BSON filter, update and sort documents and
//! converts stored documents back into [`Dbm`] rows.

use super::{SortKey, normalize_update, ops};
use crate::models::{Dbm, ID_FIELD, Identifier, Value};
use crate::{Error, Result};
use bson::{Bson, Document};
use chrono::{TimeZone, Utc};

/// Converts a query-model value into BSON.
#[must_use]
pub fn to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => Bson::Int64(*i),
        Value::Float(f) => Bson::Double(*f),
        Value::String(s) => Bson::String(s.clone()),
        Value::Id(id) => Bson::ObjectId((*id).into()),
        Value::Time(t) => Bson::DateTime(bson::DateTime::from_millis(t.timestamp_millis())),
        Value::List(items) => Bson::Array(items.iter().map(to_bson).collect()),
        Value::Doc(d) => Bson::Document(to_document(d)),
    }
}

/// Converts a [`Dbm`] into a BSON document, preserving key order.
#[must_use]
pub fn to_document(dbm: &Dbm) -> Document {
    dbm.iter().map(|(k, v)| (k.clone(), to_bson(v))).collect()
}

/// Converts BSON back into a query-model value.
///
/// Types without a query-model counterpart (binary, decimal, code) are kept as
/// their extended-JSON string form.
#[must_use]
pub fn from_bson(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::Int(i64::from(i)),
        Bson::Int64(i) => Value::Int(i),
        Bson::Double(f) => Value::Float(f),
        Bson::String(s) | Bson::Symbol(s) => Value::String(s),
        Bson::ObjectId(oid) => Value::Id(oid.into()),
        Bson::DateTime(dt) => Utc
            .timestamp_millis_opt(dt.timestamp_millis())
            .single()
            .map_or(Value::Null, Value::Time),
        Bson::Timestamp(ts) => Value::Int(i64::from(ts.time)),
        Bson::Array(items) => Value::List(items.into_iter().map(from_bson).collect()),
        Bson::Document(d) => Value::Doc(from_document(d)),
        other => Value::String(other.into_relaxed_extjson().to_string()),
    }
}

/// Converts a BSON document into a [`Dbm`].
#[must_use]
pub fn from_document(document: Document) -> Dbm {
    document.into_iter().map(|(k, v)| (k, from_bson(v))).collect()
}

/// Compiles a directive-free filter into a BSON filter document.
///
/// # Errors
///
/// - [`Error::InvalidIdentifier`] when an `_id` operand is not an identifier
/// - [`Error::InvalidInput`] when a logical operator or `$i`/`$text` operand
///   has the wrong shape
pub fn compile_filter(filter: &Dbm) -> Result<Document> {
    let mut out = Document::new();
    for (key, value) in filter {
        let compiled = if ops::is_logical(key) {
            compile_logical(key, value)?
        } else if key.starts_with('$') {
            to_bson(value)
        } else if key == ID_FIELD {
            compile_id(value)?
        } else {
            compile_field(value)?
        };
        out.insert(key.clone(), compiled);
    }
    Ok(out)
}

fn compile_logical(op: &str, value: &Value) -> Result<Bson> {
    let Value::List(items) = value else {
        return Err(Error::InvalidInput(format!("{op} needs a list of filters")));
    };
    items
        .iter()
        .map(|item| {
            item.as_doc()
                .ok_or_else(|| Error::InvalidInput(format!("{op} entries must be maps")))
                .and_then(compile_filter)
                .map(Bson::Document)
        })
        .collect::<Result<Vec<_>>>()
        .map(Bson::Array)
}

fn compile_field(value: &Value) -> Result<Bson> {
    match value {
        Value::List(items) => Ok(any_of(Bson::Array(items.iter().map(to_bson).collect()))),
        Value::Doc(expr) if value.is_operator_expr() => {
            compile_operators(expr, to_bson_ok).map(Bson::Document)
        },
        other => Ok(to_bson(other)),
    }
}

fn any_of(items: Bson) -> Bson {
    let mut expr = Document::new();
    expr.insert(ops::IN, items);
    Bson::Document(expr)
}

#[allow(clippy::unnecessary_wraps)]
fn to_bson_ok(value: &Value) -> Result<Bson> {
    Ok(to_bson(value))
}

fn compile_id(value: &Value) -> Result<Bson> {
    match value {
        Value::List(_) => Ok(any_of(id_operand(value)?)),
        Value::Doc(expr) if value.is_operator_expr() => {
            compile_operators(expr, id_operand).map(Bson::Document)
        },
        other => id_operand(other),
    }
}

/// Converts an `_id` operand, decoding hex strings into object ids.
fn id_operand(value: &Value) -> Result<Bson> {
    match value {
        Value::List(items) => items
            .iter()
            .map(id_operand)
            .collect::<Result<Vec<_>>>()
            .map(Bson::Array),
        Value::Null => Ok(Bson::Null),
        other => other
            .to_identifier()
            .map(|id| Bson::ObjectId(id.into())),
    }
}

fn compile_operators(expr: &Dbm, operand: fn(&Value) -> Result<Bson>) -> Result<Document> {
    let mut out = Document::new();
    let mut fold_case = false;
    for (op, value) in expr {
        match op.as_str() {
            ops::I => {
                let literal = string_operand(op, value)?;
                out.insert(ops::REGEX, format!("^{}$", regex::escape(literal)));
                fold_case = true;
            },
            ops::TEXT => {
                let literal = string_operand(op, value)?;
                out.insert(ops::REGEX, regex::escape(literal));
                fold_case = true;
            },
            ops::REGEX | ops::OPTIONS => {
                out.insert(op.clone(), to_bson(value));
            },
            ops::NE | ops::GT | ops::GTE | ops::LT | ops::LTE | ops::IN | ops::NIN => {
                out.insert(op.clone(), operand(value)?);
            },
            _ => {
                out.insert(op.clone(), to_bson(value));
            },
        }
    }
    // Caller options are kept; `i` is added once.
    if fold_case {
        let options = match out.get_str(ops::OPTIONS) {
            Ok(given) if given.contains('i') => given.to_string(),
            Ok(given) => format!("{given}i"),
            Err(_) => "i".to_string(),
        };
        out.insert(ops::OPTIONS, options);
    }
    Ok(out)
}

fn string_operand<'a>(op: &str, value: &'a Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| Error::InvalidInput(format!("{op} needs a string operand")))
}

/// Compiles an update document.
///
/// Plain fields are folded into `$set`; `_id` never appears in `$set`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when an operator group is not a map.
pub fn compile_update(update: &Dbm) -> Result<Document> {
    Ok(to_document(&normalize_update(update)?))
}

/// Compiles an upsert update: the update plus `$setOnInsert` for seed fields.
///
/// Seed fields already targeted by an update operator are left to that
/// operator, since the server rejects conflicting paths.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when an operator group is not a map.
pub fn compile_upsert(update: &Dbm, seed: &Dbm) -> Result<Document> {
    let normalized = normalize_update(update)?;
    let touched: Vec<&str> = normalized
        .values()
        .filter_map(Value::as_doc)
        .flat_map(|group| group.keys().map(String::as_str))
        .collect();
    let on_insert: Document = seed
        .iter()
        .filter(|(k, _)| !touched.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), to_bson(v)))
        .collect();

    let mut out = to_document(&normalized);
    if !on_insert.is_empty() {
        out.insert("$setOnInsert", on_insert);
    }
    Ok(out)
}

/// Compiles sort keys into a sort document.
#[must_use]
pub fn compile_sort(keys: &[SortKey]) -> Document {
    keys.iter()
        .map(|k| (k.field.clone(), Bson::Int32(if k.descending { -1 } else { 1 })))
        .collect()
}

/// Builds the `_id` equality filter for one identifier.
#[must_use]
pub fn id_filter(id: Identifier) -> Document {
    let mut filter = Document::new();
    filter.insert(ID_FIELD, bson::oid::ObjectId::from(id));
    filter
}
