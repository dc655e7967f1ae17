//! Relational dialect (`SQLite`).
//!
//! [`SqlTranslator`] compiles the query model into predicate chains and
//! assignment lists with numbered parameters (`?1`, `?2`, ...). Every value is
//! bound; only quoted identifiers and integer limits are spliced into the text.
//!
//! Dotted field names (`address.city`) read nested JSON through
//! `json_extract`; updates address top-level columns only.

use super::{Query, SortKey, normalize_update, ops};
use crate::models::{Dbm, ID_FIELD, Value};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;

/// A compiled statement and its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with numbered placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<SqlValue>,
}

/// Quotes an identifier, doubling embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Stored text form of a timestamp: RFC 3339 in UTC with nine fractional
/// digits, so text order is time order.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use polystore::query::sql::time_text;
///
/// let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
/// assert_eq!(time_text(&t), "2024-01-01T12:00:00.000000000Z");
/// ```
#[must_use]
pub fn time_text(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Rewrites UTC RFC 3339 text, as records serialize their timestamps, into
/// [`time_text`] form. Returns `None` for any other string.
pub(crate) fn stored_time(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    if bytes.len() < 20 || bytes[10] != b'T' || !s.ends_with('Z') {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| time_text(&t.with_timezone(&Utc)))
}

/// Reverses [`stored_time`]: fixed-width timestamp text back into the
/// shortest RFC 3339 form, as chrono serializes it.
pub(crate) fn loaded_time(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    if bytes.len() != 30 || bytes[19] != b'.' || !s.ends_with('Z') {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Converts a query-model value into a bindable `SQLite` value.
///
/// Identifiers bind as lowercase hex, timestamps as [`time_text`], booleans
/// as `0`/`1`, lists and maps as JSON text.
#[must_use]
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::String(s) => SqlValue::Text(stored_time(s).unwrap_or_else(|| s.clone())),
        Value::Id(id) => SqlValue::Text(id.hex()),
        Value::Time(t) => SqlValue::Text(time_text(t)),
        Value::List(_) | Value::Doc(_) => SqlValue::Text(stored_json(value).to_string()),
    }
}

fn stored_json(value: &Value) -> serde_json::Value {
    match value {
        Value::String(s) => {
            stored_time(s).map_or_else(|| value.to_json(), serde_json::Value::String)
        },
        Value::Time(t) => serde_json::Value::String(time_text(t)),
        Value::List(items) => serde_json::Value::Array(items.iter().map(stored_json).collect()),
        Value::Doc(d) => serde_json::Value::Object(
            d.iter().map(|(k, v)| (k.clone(), stored_json(v))).collect(),
        ),
        other => other.to_json(),
    }
}

/// Column expression for a field: a quoted column, or `json_extract` for a
/// dotted path.
#[must_use]
pub fn column_expr(field: &str) -> String {
    match field.split_once('.') {
        Some((column, path)) => format!(
            "json_extract({}, '$.{}')",
            quote_ident(column),
            path.replace('\'', "''")
        ),
        None => quote_ident(field),
    }
}

type Operand = fn(&Value) -> Result<SqlValue>;

#[allow(clippy::unnecessary_wraps)]
fn plain_operand(value: &Value) -> Result<SqlValue> {
    Ok(to_sql_value(value))
}

fn id_operand(value: &Value) -> Result<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        other => other.to_identifier().map(|id| SqlValue::Text(id.hex())),
    }
}

/// Accumulates numbered parameters while compiling one statement.
#[derive(Debug, Default)]
pub struct SqlTranslator {
    params: Vec<SqlValue>,
}

impl SqlTranslator {
    /// Creates an empty translator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a parameter and returns its placeholder.
    pub fn bind(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    /// Consumes the translator, returning the bound parameters.
    #[must_use]
    pub fn into_params(self) -> Vec<SqlValue> {
        self.params
    }

    /// Compiles a directive-free filter into a predicate.
    ///
    /// Returns `None` for an empty filter.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedOperator`] for operators SQL cannot express
    /// - [`Error::InvalidIdentifier`] for malformed `_id` operands
    /// - [`Error::InvalidInput`] for malformed operands
    pub fn predicate(&mut self, filter: &Dbm) -> Result<Option<String>> {
        let mut conditions = Vec::with_capacity(filter.len());
        for (key, value) in filter {
            let condition = if ops::is_logical(key) {
                self.logical(key, value)?
            } else if key.starts_with('$') {
                return Err(Error::UnsupportedOperator(key.clone()));
            } else {
                let operand: Operand = if key == ID_FIELD {
                    id_operand
                } else {
                    plain_operand
                };
                self.field(&column_expr(key), value, operand)?
            };
            conditions.push(condition);
        }
        Ok(match conditions.len() {
            0 => None,
            1 => conditions.pop(),
            _ => Some(conditions.join(" AND ")),
        })
    }

    fn logical(&mut self, op: &str, value: &Value) -> Result<String> {
        let Value::List(items) = value else {
            return Err(Error::InvalidInput(format!("{op} needs a list of filters")));
        };
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            let sub = item
                .as_doc()
                .ok_or_else(|| Error::InvalidInput(format!("{op} entries must be maps")))?;
            parts.push(
                self.predicate(sub)?
                    .map_or_else(|| "1 = 1".to_string(), |p| format!("({p})")),
            );
        }
        Ok(match (op, parts.is_empty()) {
            (ops::OR, true) => "0 = 1".to_string(),
            (_, true) => "1 = 1".to_string(),
            (ops::OR, false) => format!("({})", parts.join(" OR ")),
            (ops::AND, false) => format!("({})", parts.join(" AND ")),
            _ => format!("NOT ({})", parts.join(" OR ")),
        })
    }

    fn field(&mut self, col: &str, value: &Value, operand: Operand) -> Result<String> {
        match value {
            Value::Null => Ok(format!("{col} IS NULL")),
            Value::List(items) => self.any_of(col, items, operand),
            Value::Doc(expr) if value.is_operator_expr() => self.operators(col, expr, operand),
            other => {
                let p = self.bind(operand(other)?);
                Ok(format!("{col} = {p}"))
            },
        }
    }

    fn placeholders(&mut self, items: &[Value], operand: Operand) -> Result<String> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let value = operand(item)?;
            out.push(self.bind(value));
        }
        Ok(out.join(", "))
    }

    fn any_of(&mut self, col: &str, items: &[Value], operand: Operand) -> Result<String> {
        if items.is_empty() {
            return Ok("0 = 1".to_string());
        }
        let list = self.placeholders(items, operand)?;
        Ok(format!("{col} IN ({list})"))
    }

    fn operators(&mut self, col: &str, expr: &Dbm, operand: Operand) -> Result<String> {
        let mut conditions = Vec::with_capacity(expr.len());
        for (op, value) in expr {
            let condition = match op.as_str() {
                ops::NE if value.is_null() => format!("{col} IS NOT NULL"),
                ops::NE => {
                    let p = self.bind(operand(value)?);
                    format!("{col} IS NOT {p}")
                },
                ops::GT | ops::GTE | ops::LT | ops::LTE => {
                    let sym = match op.as_str() {
                        ops::GT => ">",
                        ops::GTE => ">=",
                        ops::LT => "<",
                        _ => "<=",
                    };
                    let p = self.bind(operand(value)?);
                    format!("{col} {sym} {p}")
                },
                ops::IN => self.any_of(col, list_operand(op, value)?, operand)?,
                ops::NIN => {
                    let items = list_operand(op, value)?;
                    if items.is_empty() {
                        "1 = 1".to_string()
                    } else {
                        let list = self.placeholders(items, operand)?;
                        format!("({col} IS NULL OR {col} NOT IN ({list}))")
                    }
                },
                ops::REGEX => {
                    let pattern = string_operand(op, value)?;
                    let flags = expr.get(ops::OPTIONS).and_then(Value::as_str).unwrap_or("");
                    let p = self.bind(SqlValue::Text(inline_flags(pattern, flags)));
                    format!("{col} REGEXP {p}")
                },
                ops::OPTIONS => continue,
                // LIKE folds ASCII only; the regex folds all of Unicode.
                ops::I => {
                    let literal = regex::escape(string_operand(op, value)?);
                    let p = self.bind(SqlValue::Text(format!("(?i)^{literal}$")));
                    format!("{col} REGEXP {p}")
                },
                ops::TEXT => {
                    let literal = regex::escape(string_operand(op, value)?);
                    let p = self.bind(SqlValue::Text(format!("(?i){literal}")));
                    format!("{col} REGEXP {p}")
                },
                other => {
                    let keyword = keyword_operator(other)?;
                    let p = self.bind(operand(value)?);
                    format!("{col} {keyword} {p}")
                },
            };
            conditions.push(condition);
        }
        Ok(match conditions.len() {
            0 => "1 = 1".to_string(),
            1 => conditions.remove(0),
            _ => format!("({})", conditions.join(" AND ")),
        })
    }

    /// Compiles an update document into `SET` assignments.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] when the update is empty, targets `_id`, or
    ///   uses a dotted path
    /// - [`Error::UnsupportedOperator`] for unknown update operators
    pub fn assignments(&mut self, update: &Dbm) -> Result<Vec<String>> {
        let normalized = normalize_update(update)?;
        let mut out = Vec::new();
        for (op, group) in &normalized {
            let Value::Doc(fields) = group else {
                continue;
            };
            for (field, value) in fields {
                if field == ID_FIELD || field.contains('.') {
                    return Err(Error::InvalidInput(format!(
                        "cannot assign '{field}' with {op}"
                    )));
                }
                let col = quote_ident(field);
                let assignment = match op.as_str() {
                    ops::SET => {
                        let p = self.bind(to_sql_value(value));
                        format!("{col} = {p}")
                    },
                    ops::UNSET => format!("{col} = NULL"),
                    ops::INC => {
                        let p = self.bind(to_sql_value(value));
                        format!("{col} = COALESCE({col}, 0) + {p}")
                    },
                    ops::MIN | ops::MAX => {
                        let func = if op == ops::MIN { "MIN" } else { "MAX" };
                        let p = self.bind(to_sql_value(value));
                        format!("{col} = {func}(COALESCE({col}, {p}), {p})")
                    },
                    other => return Err(Error::UnsupportedOperator(other.to_string())),
                };
                out.push(assignment);
            }
        }
        if out.is_empty() {
            return Err(Error::InvalidInput("update has no fields".to_string()));
        }
        Ok(out)
    }
}

fn list_operand<'a>(op: &str, value: &'a Value) -> Result<&'a [Value]> {
    match value {
        Value::List(items) => Ok(items),
        _ => Err(Error::InvalidInput(format!("{op} needs a list operand"))),
    }
}

fn string_operand<'a>(op: &str, value: &'a Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| Error::InvalidInput(format!("{op} needs a string operand")))
}

/// Maps `$glob`-style operators onto SQL keyword operators.
fn keyword_operator(op: &str) -> Result<String> {
    let name = op.trim_start_matches('$');
    let keyword = name.to_ascii_uppercase();
    if name.is_empty()
        || !name.chars().all(|c| c.is_ascii_alphabetic())
        || matches!(keyword.as_str(), "AND" | "OR" | "NOT" | "NOR")
    {
        return Err(Error::UnsupportedOperator(op.to_string()));
    }
    Ok(keyword)
}

/// Prefixes a pattern with inline flags understood by the `regex` crate.
fn inline_flags(pattern: &str, options: &str) -> String {
    let flags: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();
    if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    }
}

/// Renders an `ORDER BY` clause, or an empty string.
#[must_use]
pub fn order_by(keys: &[SortKey]) -> String {
    if keys.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = keys
        .iter()
        .map(|k| {
            format!(
                "{} {}",
                column_expr(&k.field),
                if k.descending { "DESC" } else { "ASC" }
            )
        })
        .collect();
    format!(" ORDER BY {}", parts.join(", "))
}

/// Renders `LIMIT`/`OFFSET`; `LIMIT -1` stands for "no limit" when only an
/// offset is set.
#[must_use]
pub fn limit_offset(limit: Option<u64>, offset: Option<u64>) -> String {
    let clamp = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
    match (limit, offset) {
        (None, None) => String::new(),
        (Some(l), None) => format!(" LIMIT {}", clamp(l)),
        (None, Some(o)) => format!(" LIMIT -1 OFFSET {}", clamp(o)),
        (Some(l), Some(o)) => format!(" LIMIT {} OFFSET {}", clamp(l), clamp(o)),
    }
}

/// Renders ` WHERE <predicate>`, or an empty string.
#[must_use]
pub fn where_clause(predicate: Option<String>) -> String {
    predicate.map_or_else(String::new, |p| format!(" WHERE {p}"))
}

/// Compiles a `SELECT *` for a parsed query.
///
/// The sharding hint has no relational meaning and is not applied.
///
/// # Errors
///
/// Returns translation errors from [`SqlTranslator::predicate`].
pub fn select(table: &str, query: &Query) -> Result<Statement> {
    let mut tr = SqlTranslator::new();
    let predicate = tr.predicate(&query.filter)?;
    let sql = format!(
        "SELECT * FROM {}{}{}{}",
        quote_ident(table),
        where_clause(predicate),
        order_by(&query.sort),
        limit_offset(query.limit, query.offset)
    );
    Ok(Statement {
        sql,
        params: tr.into_params(),
    })
}

/// Compiles a `SELECT COUNT(*)`.
///
/// # Errors
///
/// Returns translation errors from [`SqlTranslator::predicate`].
pub fn count(table: &str, filter: &Dbm) -> Result<Statement> {
    let mut tr = SqlTranslator::new();
    let predicate = tr.predicate(filter)?;
    Ok(Statement {
        sql: format!(
            "SELECT COUNT(*) FROM {}{}",
            quote_ident(table),
            where_clause(predicate)
        ),
        params: tr.into_params(),
    })
}

/// Restricts a statement to the first matching row through a rowid subselect.
fn target_rows(table: &str, predicate: Option<String>, multi: bool) -> String {
    if multi {
        where_clause(predicate)
    } else {
        format!(
            " WHERE rowid IN (SELECT rowid FROM {}{} LIMIT 1)",
            quote_ident(table),
            where_clause(predicate)
        )
    }
}

/// Compiles an `UPDATE`; with `multi == false` at most one row changes.
///
/// # Errors
///
/// Returns translation errors from the predicate or assignments.
pub fn update(table: &str, filter: &Dbm, update: &Dbm, multi: bool) -> Result<Statement> {
    let mut tr = SqlTranslator::new();
    let assignments = tr.assignments(update)?;
    let predicate = tr.predicate(filter)?;
    Ok(Statement {
        sql: format!(
            "UPDATE {} SET {}{}",
            quote_ident(table),
            assignments.join(", "),
            target_rows(table, predicate, multi)
        ),
        params: tr.into_params(),
    })
}

/// Compiles a `DELETE`; with `multi == false` at most one row is removed.
///
/// # Errors
///
/// Returns translation errors from [`SqlTranslator::predicate`].
pub fn delete(table: &str, filter: &Dbm, multi: bool) -> Result<Statement> {
    let mut tr = SqlTranslator::new();
    let predicate = tr.predicate(filter)?;
    Ok(Statement {
        sql: format!(
            "DELETE FROM {}{}",
            quote_ident(table),
            target_rows(table, predicate, multi)
        ),
        params: tr.into_params(),
    })
}

/// Compiles an `INSERT` of one row.
#[must_use]
pub fn insert(table: &str, row: &Dbm) -> Statement {
    let columns: Vec<String> = row.keys().map(|k| quote_ident(k)).collect();
    let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
    Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", ")
        ),
        params: row.values().map(to_sql_value).collect(),
    }
}
