//! Update-or-insert and multi-row updates.
//!
//! Both run inside one `IMMEDIATE` transaction, so the write lock is taken up
//! front and a concurrent writer cannot slip in between the match and the
//! insert. Dropping the transaction without committing rolls it back, which
//! covers early returns and panics alike.

use super::rows::{self, ensure_columns, filter_columns, update_columns};
use crate::models::{Dbm, ID_FIELD, Identifier, Schema, Value};
use crate::query::sql::{self, SqlTranslator, quote_ident, where_clause};
use crate::query::{equality_fields, normalize_update, ops};
use crate::{Error, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params_from_iter};
use std::collections::BTreeSet;

/// Builds the row inserted when nothing matches:
/// `seed ∪ filter equality fields ∪ $set ∪ $inc ∪ $min/$max − $unset`.
///
/// Dotted filter fields address nested JSON and are not copied. A missing
/// identifier is generated.
pub(super) fn insert_row(filter: &Dbm, update: &Dbm, seed: &Dbm) -> Result<Dbm> {
    let mut row = seed.clone();
    row.extend(
        equality_fields(filter)
            .into_iter()
            .filter(|(k, _)| !k.contains('.')),
    );
    for (op, group) in &normalize_update(update)? {
        let Value::Doc(fields) = group else {
            continue;
        };
        for (field, value) in fields {
            match op.as_str() {
                ops::SET | ops::INC | ops::MIN | ops::MAX => {
                    row.insert(field.clone(), value.clone());
                },
                ops::UNSET => {
                    row.remove(field);
                },
                other => return Err(Error::UnsupportedOperator(other.to_string())),
            }
        }
    }
    let id = match row.get(ID_FIELD) {
        Some(value) => value.to_identifier()?,
        None => Identifier::new(),
    };
    row.insert(ID_FIELD.to_string(), Value::Id(id));
    Ok(row)
}

/// Updates the first row matching `filter`, or inserts one; returns the row
/// as stored.
pub(super) fn upsert(
    conn: &mut Connection,
    table: &str,
    filter: &Dbm,
    update: &Dbm,
    seed: &Dbm,
    schema: Option<&Schema>,
) -> Result<Dbm> {
    // Compile everything before touching the database.
    let mut tr = SqlTranslator::new();
    let predicate = tr.predicate(filter)?;
    let match_sql = format!(
        "SELECT rowid FROM {}{} LIMIT 1",
        quote_ident(table),
        where_clause(predicate)
    );
    let match_params = tr.into_params();

    let mut tr = SqlTranslator::new();
    let assignments = tr.assignments(update)?;
    let mut update_params = tr.into_params();
    let update_sql = format!(
        "UPDATE {} SET {} WHERE rowid = ?{}",
        quote_ident(table),
        assignments.join(", "),
        update_params.len() + 1
    );

    let new_row = insert_row(filter, update, seed)?;
    let insert = sql::insert(table, &new_row);

    let mut columns = BTreeSet::new();
    filter_columns(filter, &mut columns);
    update_columns(update, &mut columns);
    columns.extend(new_row.keys().cloned());
    ensure_columns(conn, table, columns.iter().map(String::as_str))?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let matched: Option<i64> = tx
        .query_row(&match_sql, params_from_iter(match_params.iter()), |r| {
            r.get(0)
        })
        .optional()?;
    let rowid = if let Some(rowid) = matched {
        update_params.push(SqlValue::Integer(rowid));
        tx.execute(&update_sql, params_from_iter(update_params.iter()))?;
        tracing::debug!(table, rowid, "Upsert matched");
        rowid
    } else {
        tx.execute(&insert.sql, params_from_iter(insert.params.iter()))?;
        tracing::debug!(table, "Upsert inserted");
        tx.last_insert_rowid()
    };
    let stored = rows::query_rows(
        &tx,
        &format!("SELECT * FROM {} WHERE rowid = ?1", quote_ident(table)),
        &[SqlValue::Integer(rowid)],
        schema,
    )?
    .into_iter()
    .next()
    .ok_or(Error::NotFound)?;
    tx.commit()?;
    Ok(stored)
}

/// Applies each `(filter, update)` pair to at most one row, all or nothing.
pub(super) fn bulk_update(conn: &mut Connection, table: &str, pairs: &[(Dbm, Dbm)]) -> Result<u64> {
    let statements = pairs
        .iter()
        .map(|(filter, update)| sql::update(table, filter, update, false))
        .collect::<Result<Vec<_>>>()?;

    if !rows::table_exists(conn, table)? {
        return Ok(0);
    }
    let mut columns = BTreeSet::new();
    for (filter, update) in pairs {
        filter_columns(filter, &mut columns);
        update_columns(update, &mut columns);
    }
    ensure_columns(conn, table, columns.iter().map(String::as_str))?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut matched = 0u64;
    for statement in &statements {
        let changed = tx.execute(&statement.sql, params_from_iter(statement.params.iter()))?;
        matched += u64::try_from(changed).unwrap_or(u64::MAX);
    }
    tx.commit()?;
    Ok(matched)
}
