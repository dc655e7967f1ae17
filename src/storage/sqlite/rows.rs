//! Table layout and row decoding.

use crate::Result;
use crate::models::{Dbm, FieldKind, ID_FIELD, Identifier, Schema, Value};
use crate::query::ops;
use crate::query::sql::{loaded_time, quote_ident};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::{BTreeSet, HashSet};

/// Returns `true` when `table` exists.
pub(super) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn existing_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt
        .query_map([table], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(names)
}

/// Top-level column behind a field name; dotted paths live in their first
/// segment.
pub(super) fn base_column(field: &str) -> &str {
    field.split_once('.').map_or(field, |(column, _)| column)
}

/// Creates `table` if needed and adds a column for every new field.
pub(super) fn ensure_columns<'a, I>(conn: &Connection, table: &str, fields: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY)",
        quote_ident(table),
        quote_ident(ID_FIELD)
    ))?;
    let mut existing = existing_columns(conn, table)?;
    for field in fields {
        let column = base_column(field);
        if column.is_empty() || column.starts_with('$') || existing.contains(column) {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            quote_ident(column)
        ))?;
        tracing::debug!(table, column, "Added column");
        existing.insert(column.to_string());
    }
    Ok(())
}

/// Collects the columns a filter reads, descending into logical operators.
pub(super) fn filter_columns(filter: &Dbm, out: &mut BTreeSet<String>) {
    for (key, value) in filter {
        if ops::is_logical(key) {
            if let Value::List(items) = value {
                for sub in items.iter().filter_map(Value::as_doc) {
                    filter_columns(sub, out);
                }
            }
        } else if !key.starts_with('$') {
            out.insert(base_column(key).to_string());
        }
    }
}

/// Collects the columns an update document writes.
pub(super) fn update_columns(update: &Dbm, out: &mut BTreeSet<String>) {
    for (key, value) in update {
        match value {
            Value::Doc(fields) if key.starts_with('$') => {
                out.extend(fields.keys().map(|f| base_column(f).to_string()));
            },
            _ => {
                out.insert(base_column(key).to_string());
            },
        }
    }
}

/// Decodes one result row.
///
/// `NULL` columns are left out, as an unset field is on a document store.
/// Integers are read back as booleans and text as JSON where the declared
/// schema says so; the identifier column decodes to [`Value::Id`].
pub(super) fn decode(
    row: &Row<'_>,
    columns: &[String],
    schema: Option<&Schema>,
) -> rusqlite::Result<Dbm> {
    let mut out = Dbm::new();
    for (i, name) in columns.iter().enumerate() {
        let kind = schema.map_or(FieldKind::Scalar, |s| s.kind(name));
        let value = match row.get_ref(i)? {
            ValueRef::Null => continue,
            ValueRef::Integer(n) if kind == FieldKind::Bool => Value::Bool(n != 0),
            ValueRef::Integer(n) => Value::Int(n),
            ValueRef::Real(f) => Value::Float(f),
            ValueRef::Text(bytes) => decode_text(name, &String::from_utf8_lossy(bytes), kind),
            ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}

fn decode_text(name: &str, text: &str, kind: FieldKind) -> Value {
    if name == ID_FIELD {
        if let Ok(id) = Identifier::from_hex(text) {
            return Value::Id(id);
        }
    }
    if kind == FieldKind::Json {
        if let Ok(json) = serde_json::from_str(text) {
            return restore_times(Value::from_json(json));
        }
    }
    Value::String(loaded_time(text).unwrap_or_else(|| text.to_string()))
}

fn restore_times(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(loaded_time(&s).unwrap_or(s)),
        Value::List(items) => Value::List(items.into_iter().map(restore_times).collect()),
        Value::Doc(d) => Value::Doc(d.into_iter().map(|(k, v)| (k, restore_times(v))).collect()),
        other => other,
    }
}

/// Runs a `SELECT *` and decodes every row.
pub(super) fn query_rows(
    conn: &Connection,
    sql: &str,
    params: &[rusqlite::types::Value],
    schema: Option<&Schema>,
) -> Result<Vec<Dbm>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(ToString::to_string)
        .collect();
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            decode(row, &columns, schema)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
