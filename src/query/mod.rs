//! Query translation.
//!
//! [`Query::parse`] strips the reserved directives out of a [`Dbm`]; the
//! remaining filter is compiled by a backend dialect:
//!
//! - [`document`]: BSON filter/update documents for document stores
//! - [`sql`]: predicate chains and assignment lists for relational stores

pub mod document;
pub mod sql;

use crate::models::{DbObject, Dbm, ID_FIELD, Value};
use crate::{Error, Result};

/// Sort directive: a field name or list of field names, `-` prefix for descending.
pub const SORT: &str = "_sort";
/// Result collection override.
pub const COLLECTION: &str = "_collection";
/// Maximum number of results.
pub const LIMIT: &str = "_limit";
/// Number of results to skip.
pub const OFFSET: &str = "_offset";
/// Sharding hint: a map of shard-key fields routed with the filter.
pub const SHARD: &str = "_shard";

/// All reserved directive keys.
pub const DIRECTIVES: [&str; 5] = [SORT, COLLECTION, LIMIT, OFFSET, SHARD];

/// Operator names understood by the translators.
pub mod ops {
    /// Not equal.
    pub const NE: &str = "$ne";
    /// Greater than.
    pub const GT: &str = "$gt";
    /// Greater than or equal.
    pub const GTE: &str = "$gte";
    /// Less than.
    pub const LT: &str = "$lt";
    /// Less than or equal.
    pub const LTE: &str = "$lte";
    /// Any of.
    pub const IN: &str = "$in";
    /// None of.
    pub const NIN: &str = "$nin";
    /// Logical or over sub-filters.
    pub const OR: &str = "$or";
    /// Logical and over sub-filters.
    pub const AND: &str = "$and";
    /// Logical nor over sub-filters.
    pub const NOR: &str = "$nor";
    /// Case-insensitive whole-value match.
    pub const I: &str = "$i";
    /// Case-insensitive substring match.
    pub const TEXT: &str = "$text";
    /// Regular expression match.
    pub const REGEX: &str = "$regex";
    /// Regular expression flags.
    pub const OPTIONS: &str = "$options";
    /// Assign fields.
    pub const SET: &str = "$set";
    /// Remove fields.
    pub const UNSET: &str = "$unset";
    /// Increment numeric fields.
    pub const INC: &str = "$inc";
    /// Keep the smaller value.
    pub const MIN: &str = "$min";
    /// Keep the larger value.
    pub const MAX: &str = "$max";

    /// Returns `true` for operators whose operand is a list of sub-filters.
    #[must_use]
    pub fn is_logical(op: &str) -> bool {
        matches!(op, OR | AND | NOR)
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    /// Field name.
    pub field: String,
    /// Descending order.
    pub descending: bool,
}

impl SortKey {
    fn parse(s: &str) -> Result<Self> {
        let (field, descending) = s
            .strip_prefix('-')
            .map_or_else(|| (s.strip_prefix('+').unwrap_or(s), false), |f| (f, true));
        if field.is_empty() {
            return Err(Error::InvalidInput(format!("empty sort key '{s}'")));
        }
        Ok(Self {
            field: field.to_string(),
            descending,
        })
    }
}

/// A filter with its directives pulled out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// The filter, free of directives.
    pub filter: Dbm,
    /// Sort keys in priority order.
    pub sort: Vec<SortKey>,
    /// Maximum number of results.
    pub limit: Option<u64>,
    /// Number of results to skip.
    pub offset: Option<u64>,
    /// Sharding hint fields.
    pub shard: Option<Dbm>,
    /// Explicit collection override.
    pub collection: Option<String>,
}

impl Query {
    /// Splits `dbm` into a filter and its directives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when a directive has the wrong type.
    pub fn parse(dbm: &Dbm) -> Result<Self> {
        let mut query = Self::default();
        for (key, value) in dbm {
            match key.as_str() {
                SORT => query.sort = parse_sort(value)?,
                LIMIT => query.limit = Some(parse_count(LIMIT, value)?),
                OFFSET => query.offset = Some(parse_count(OFFSET, value)?),
                COLLECTION => {
                    let name = value.as_str().filter(|s| !s.is_empty()).ok_or_else(|| {
                        Error::InvalidInput(format!("{COLLECTION} must be a non-empty string"))
                    })?;
                    query.collection = Some(name.to_string());
                },
                SHARD => {
                    let hint = value.as_doc().ok_or_else(|| {
                        Error::InvalidInput(format!("{SHARD} must be a map of shard-key fields"))
                    })?;
                    query.shard = Some(hint.clone());
                },
                _ => {
                    query.filter.insert(key.clone(), value.clone());
                },
            }
        }
        Ok(query)
    }

    /// Builds a query matching a single identifier.
    #[must_use]
    pub fn by_id(id: crate::models::Identifier) -> Self {
        let mut filter = Dbm::new();
        filter.insert(ID_FIELD.to_string(), Value::Id(id));
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Returns the filter with the sharding hint merged in.
    #[must_use]
    pub fn routed_filter(&self) -> Dbm {
        let mut filter = self.filter.clone();
        if let Some(shard) = &self.shard {
            for (k, v) in shard {
                filter.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        filter
    }
}

fn parse_sort(value: &Value) -> Result<Vec<SortKey>> {
    match value {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(SortKey::parse)
            .collect(),
        Value::List(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| Error::InvalidInput(format!("{SORT} entries must be strings")))
                    .and_then(SortKey::parse)
            })
            .collect(),
        other => Err(Error::InvalidInput(format!(
            "{SORT} must be a string or list, got {other:?}"
        ))),
    }
}

fn parse_count(name: &str, value: &Value) -> Result<u64> {
    value
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| Error::InvalidInput(format!("{name} must be a non-negative integer")))
}

/// Resolves the target collection: explicit override, then the row's table name.
///
/// # Errors
///
/// Returns [`Error::NoCollectionName`] when neither is available.
pub fn resolve_collection<T: DbObject + ?Sized>(
    explicit: Option<&str>,
    row: &T,
) -> Result<String> {
    explicit
        .or_else(|| row.table_name())
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .ok_or(Error::NoCollectionName)
}

/// Extracts the plain equality fields of a filter.
///
/// Operator expressions, lists and logical operators are skipped; these are the
/// fields an upsert copies into a freshly inserted row.
#[must_use]
pub fn equality_fields(filter: &Dbm) -> Dbm {
    filter
        .iter()
        .filter(|(k, v)| {
            !k.starts_with('$')
                && !DIRECTIVES.contains(&k.as_str())
                && !matches!(v, Value::List(_))
                && !v.is_operator_expr()
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Splits an update document into operator groups.
///
/// Plain top-level fields are folded into `$set`; `_id` is dropped from `$set`
/// because identifiers never change. Unknown operators are kept as-is.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when an operator group is not a map.
pub fn normalize_update(update: &Dbm) -> Result<Dbm> {
    let mut out = Dbm::new();
    let mut set = Dbm::new();
    for (key, value) in update {
        if key.starts_with('$') {
            let Value::Doc(group) = value else {
                return Err(Error::InvalidInput(format!(
                    "update operator {key} needs a map of fields"
                )));
            };
            if key == ops::SET {
                set.extend(group.iter().map(|(k, v)| (k.clone(), v.clone())));
            } else {
                out.insert(key.clone(), value.clone());
            }
        } else {
            set.insert(key.clone(), value.clone());
        }
    }
    set.remove(ID_FIELD);
    if !set.is_empty() {
        out.insert(ops::SET.to_string(), Value::Doc(set));
    }
    Ok(out)
}

/// Returns `true` when a filter matches everything.
#[must_use]
pub fn is_global(filter: &Dbm) -> bool {
    filter.is_empty()
}
