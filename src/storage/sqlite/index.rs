//! Index management.
//!
//! Indexes are created as `"<table>__<name>"` so names only need to be unique
//! per table. `SQLite` has no native notion of TTL or special key kinds, so
//! every descriptor is also recorded in [`META_TABLE`]; rows whose TTL field
//! has expired are purged before each read of the table.

use super::rows::{ensure_columns, table_exists};
use crate::models::{IndexDescriptor, IndexKey, IndexKind};
use crate::query::sql::{column_expr, quote_ident};
use crate::{Error, Result};
use chrono::{SecondsFormat, TimeDelta, Utc};
use rusqlite::{Connection, TransactionBehavior, params};
use std::collections::HashMap;

/// Side table holding the full descriptor of each index.
pub(super) const META_TABLE: &str = "_polystore_index_meta";

fn ensure_meta(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {META_TABLE} (
            table_name TEXT NOT NULL,
            index_name TEXT NOT NULL,
            keys TEXT NOT NULL,
            ttl_seconds INTEGER,
            background INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (table_name, index_name)
        )"
    ))?;
    Ok(())
}

fn physical_name(table: &str, name: &str) -> String {
    format!("{table}__{name}")
}

/// Creates an index and records its descriptor.
///
/// Special kinds have no relational equivalent and are built ascending.
pub(super) fn create(conn: &mut Connection, table: &str, index: &IndexDescriptor) -> Result<()> {
    index.validate()?;
    let name = index.resolved_name();
    let columns: Vec<String> = index
        .keys
        .iter()
        .map(|k| {
            let dir = if k.kind == IndexKind::Descending {
                "DESC"
            } else {
                "ASC"
            };
            format!("{} {dir}", column_expr(&k.field))
        })
        .collect();
    let keys = serde_json::to_string(&index.keys)?;
    let ttl = index
        .ttl_seconds
        .map(|t| i64::try_from(t).unwrap_or(i64::MAX));

    ensure_columns(conn, table, index.keys.iter().map(|k| k.field.as_str()))?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    ensure_meta(&tx)?;
    tx.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&physical_name(table, &name)),
        quote_ident(table),
        columns.join(", ")
    ))?;
    tx.execute(
        &format!(
            "INSERT INTO {META_TABLE} (table_name, index_name, keys, ttl_seconds, background)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (table_name, index_name) DO UPDATE SET
                keys = excluded.keys,
                ttl_seconds = excluded.ttl_seconds,
                background = excluded.background"
        ),
        params![table, name, keys, ttl, index.background],
    )?;
    tx.commit()?;
    tracing::debug!(table, index = %name, "Created index");
    Ok(())
}

fn read_meta(conn: &Connection, table: &str) -> Result<HashMap<String, IndexDescriptor>> {
    if !table_exists(conn, META_TABLE)? {
        return Ok(HashMap::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT index_name, keys, ttl_seconds, background FROM {META_TABLE} WHERE table_name = ?1"
    ))?;
    let rows = stmt
        .query_map([table], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<i64>>(2)?,
                r.get::<_, bool>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut out = HashMap::with_capacity(rows.len());
    for (name, keys, ttl, background) in rows {
        let keys: Vec<IndexKey> =
            serde_json::from_str(&keys).map_err(|e| Error::OperationFailed {
                operation: "read_index_meta".to_string(),
                cause: format!("index {name}: {e}"),
            })?;
        out.insert(
            name.clone(),
            IndexDescriptor {
                name: Some(name),
                keys,
                background,
                ttl_seconds: ttl.and_then(|t| u64::try_from(t).ok()),
            },
        );
    }
    Ok(out)
}

/// Lists the user-created indexes of `table`, sorted by name.
pub(super) fn list(conn: &Connection, table: &str) -> Result<Vec<IndexDescriptor>> {
    if !table_exists(conn, table)? {
        return Ok(Vec::new());
    }
    let mut meta = read_meta(conn, table)?;
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_list(?1) WHERE origin = 'c'")?;
    let physical = stmt
        .query_map([table], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let prefix = physical_name(table, "");
    let mut out = Vec::with_capacity(physical.len());
    for index_name in physical {
        let name = index_name
            .strip_prefix(&prefix)
            .unwrap_or(&index_name)
            .to_string();
        if let Some(descriptor) = meta.remove(&name) {
            out.push(descriptor);
            continue;
        }
        // Created outside this crate: recover what the catalog knows.
        let mut keys_stmt = conn.prepare(
            "SELECT name, \"desc\" FROM pragma_index_xinfo(?1) WHERE key = 1 ORDER BY seqno",
        )?;
        let keys = keys_stmt
            .query_map([&index_name], |r| {
                Ok((r.get::<_, Option<String>>(0)?, r.get::<_, bool>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter_map(|(field, desc)| {
                field.map(|f| if desc { IndexKey::desc(f) } else { IndexKey::asc(f) })
            })
            .collect();
        out.push(IndexDescriptor {
            name: Some(name),
            keys,
            ..IndexDescriptor::default()
        });
    }
    out.sort_by_key(IndexDescriptor::resolved_name);
    Ok(out)
}

/// Deletes rows whose TTL field is older than the index TTL.
///
/// Numeric fields are read as Unix seconds, anything else as a date-time
/// string. Rows without the field never expire.
pub(super) fn purge_expired(conn: &Connection, table: &str) -> Result<u64> {
    if !table_exists(conn, META_TABLE)? {
        return Ok(0);
    }
    let ttl_indexes: Vec<IndexDescriptor> = read_meta(conn, table)?
        .into_values()
        .filter(|d| d.ttl_seconds.is_some())
        .collect();

    let now = Utc::now();
    let mut purged = 0;
    for descriptor in ttl_indexes {
        let (Some(key), Some(ttl)) = (descriptor.keys.first(), descriptor.ttl_seconds) else {
            continue;
        };
        let Some(cutoff) = i64::try_from(ttl)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|d| now.checked_sub_signed(d))
        else {
            continue;
        };
        let col = column_expr(&key.field);
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE CASE WHEN typeof({col}) IN ('integer', 'real') \
                 THEN {col} < ?2 ELSE julianday({col}) < julianday(?1) END",
                quote_ident(table)
            ),
            params![
                cutoff.to_rfc3339_opts(SecondsFormat::Millis, true),
                cutoff.timestamp()
            ],
        )?;
        purged += u64::try_from(removed).unwrap_or(u64::MAX);
    }
    if purged > 0 {
        tracing::debug!(table, purged, "Purged expired rows");
    }
    Ok(purged)
}
