//! `SQLite` integration tests.
//!
//! Exercises the typed store end to end against the embedded backend:
//! - CRUD through the record mapping
//! - Operator semantics (`$i`, `$text`, `$regex`, `$nin`, logical operators)
//! - Upsert and bulk-update emulation
//! - Index metadata and TTL purging
//! - Persistence across reconnects for on-disk databases

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use polystore::models::{DbObject, Identifier};
use polystore::{ClientOpts, Dbm, Error, IndexDescriptor, IndexKind, Store, dbm, is_not_found};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct User {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    id: Option<Identifier>,
    name: String,
    email: String,
    age: i64,
    verified: bool,
    tags: Vec<String>,
}

impl DbObject for User {
    fn id(&self) -> Option<Identifier> {
        self.id
    }

    fn set_id(&mut self, id: Identifier) {
        self.id = Some(id);
    }

    fn table_name(&self) -> Option<&str> {
        Some("users")
    }
}

fn user(name: &str, age: i64) -> User {
    User {
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        age,
        ..User::default()
    }
}

fn memory_store() -> Store {
    Store::connect(ClientOpts::new("sqlite::memory:")).unwrap()
}

fn seeded() -> Store {
    let store = memory_store();
    for (name, age) in [("Jane", 8), ("John", 35), ("a.b*c", 50), ("Mary", 61)] {
        store.insert(&mut user(name, age)).unwrap();
    }
    store
}

fn names(rows: &[User]) -> Vec<&str> {
    rows.iter().map(|u| u.name.as_str()).collect()
}

// ============================================================================
// CRUD
// ============================================================================

#[test]
fn test_insert_then_find_by_identifier() {
    let store = memory_store();
    let mut jane = User {
        tags: vec!["kid".to_string()],
        verified: true,
        ..user("Jane", 8)
    };
    assert!(jane.id.is_none());

    let id = store.insert(&mut jane).unwrap();
    assert_eq!(jane.id, Some(id));
    assert_eq!(Identifier::from_hex(&id.hex()).unwrap(), id);

    let found: User = store.find_by_id(id).unwrap();
    assert_eq!(found.name, "Jane");
    assert_eq!(found.age, 8);
    assert_eq!(found.tags, ["kid"]);
    assert!(found.verified);
}

#[test]
fn test_duplicate_identifier_is_driver_error() {
    let store = memory_store();
    let mut jane = user("Jane", 8);
    store.insert(&mut jane).unwrap();
    let err = store.insert(&mut jane).unwrap_err();
    assert!(matches!(err, Error::Sqlite(_)), "got {err:?}");
}

#[test]
fn test_find_by_identifier_list() {
    let store = memory_store();
    let mut a = user("A", 1);
    let mut b = user("B", 2);
    store.insert(&mut a).unwrap();
    store.insert(&mut b).unwrap();
    store.insert(&mut user("C", 3)).unwrap();

    let rows: Vec<User> = store
        .find(&dbm! {
            "_id" => vec![a.id.unwrap().hex(), b.id.unwrap().hex()],
            "_sort" => "name",
        })
        .unwrap();
    assert_eq!(names(&rows), ["A", "B"]);
}

#[test]
fn test_invalid_identifier_in_filter_fails_fast() {
    let store = seeded();
    let err = store.find::<User>(&dbm! { "_id" => "not-hex" });
    assert!(matches!(err, Err(Error::InvalidIdentifier(_))));
}

#[test]
fn test_paging_directives() {
    let store = seeded();
    let page: Vec<User> = store
        .find(&dbm! { "_sort" => vec!["-age"], "_limit" => 2, "_offset" => 1 })
        .unwrap();
    assert_eq!(names(&page), ["a.b*c", "John"]);

    let err = store.find::<User>(&dbm! { "_limit" => "ten" });
    assert!(matches!(err, Err(Error::InvalidInput(_))));
}

#[test]
fn test_shard_hint_is_ignored_by_sqlite() {
    let store = seeded();
    let rows: Vec<User> = store
        .find(&dbm! { "name" => "Jane", "_shard" => dbm! { "region" => "eu" } })
        .unwrap();
    assert_eq!(names(&rows), ["Jane"]);
}

#[test]
fn test_missing_table_reads_empty() {
    let store = memory_store();
    assert!(store.find::<User>(&Dbm::new()).unwrap().is_empty());
    assert_eq!(store.count::<User>(&Dbm::new()).unwrap(), 0);
    let err = store.find_one::<User>(&dbm! { "name" => "x" }).unwrap_err();
    assert!(is_not_found(&err));
}

// ============================================================================
// Operator Semantics
// ============================================================================

#[test]
fn test_case_insensitive_whole_match_is_literal() {
    let store = seeded();
    let rows: Vec<User> = store.find(&dbm! { "name" => dbm! { "$i" => "A.B*C" } }).unwrap();
    assert_eq!(names(&rows), ["a.b*c"]);

    let rows: Vec<User> = store.find(&dbm! { "name" => dbm! { "$i" => "a_b*c" } }).unwrap();
    assert!(rows.is_empty(), "wildcards are matched literally");

    let rows: Vec<User> = store.find(&dbm! { "name" => dbm! { "$i" => "jan" } }).unwrap();
    assert!(rows.is_empty(), "match is anchored");
}

#[test]
fn test_text_substring_search() {
    let store = seeded();
    let rows: Vec<User> = store
        .find(&dbm! { "name" => dbm! { "$text" => "AR" }, "_sort" => "name" })
        .unwrap();
    assert_eq!(names(&rows), ["Mary"]);
}

#[test]
fn test_case_insensitive_operators_fold_unicode() {
    let store = memory_store();
    for name in ["Édith", "Ömer", "Ana"] {
        store.insert(&mut user(name, 30)).unwrap();
    }

    let rows: Vec<User> = store.find(&dbm! { "name" => dbm! { "$i" => "édith" } }).unwrap();
    assert_eq!(names(&rows), ["Édith"]);

    let rows: Vec<User> = store.find(&dbm! { "name" => dbm! { "$text" => "ÖM" } }).unwrap();
    assert_eq!(names(&rows), ["Ömer"]);
}

#[test]
fn test_regex_with_options() {
    let store = seeded();
    let rows: Vec<User> = store
        .find(&dbm! {
            "name" => dbm! { "$regex" => "^j", "$options" => "i" },
            "_sort" => "name",
        })
        .unwrap();
    assert_eq!(names(&rows), ["Jane", "John"]);
}

#[test]
fn test_range_and_membership_operators() {
    let store = seeded();
    let rows: Vec<User> = store
        .find(&dbm! { "age" => dbm! { "$gte" => 8, "$lt" => 50 }, "_sort" => "age" })
        .unwrap();
    assert_eq!(names(&rows), ["Jane", "John"]);

    let rows: Vec<User> = store
        .find(&dbm! { "name" => dbm! { "$nin" => vec!["Jane", "John"] }, "_sort" => "age" })
        .unwrap();
    assert_eq!(names(&rows), ["a.b*c", "Mary"]);

    let rows: Vec<User> = store
        .find(&dbm! { "name" => dbm! { "$ne" => "Jane" } })
        .unwrap();
    assert_eq!(rows.len(), 3);
}

#[test]
fn test_logical_operators() {
    let store = seeded();
    let rows: Vec<User> = store
        .find(&dbm! {
            "$or" => vec![dbm! { "name" => "Jane" }, dbm! { "age" => dbm! { "$gt" => 60 } }],
            "_sort" => "name",
        })
        .unwrap();
    assert_eq!(names(&rows), ["Jane", "Mary"]);

    let rows: Vec<User> = store
        .find(&dbm! { "$nor" => vec![dbm! { "age" => dbm! { "$lt" => 40 } }] })
        .unwrap();
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_unsupported_top_level_operator() {
    let store = memory_store();
    let err = store.find::<User>(&dbm! { "$where" => "1" });
    assert!(matches!(err, Err(Error::UnsupportedOperator(_))));
}

// ============================================================================
// Updates, Upsert and Bulk Update
// ============================================================================

#[test]
fn test_update_all_with_operators() {
    let store = seeded();
    let n = store
        .update_all::<User>(
            &dbm! { "age" => dbm! { "$gte" => 35 } },
            &dbm! { "$inc" => dbm! { "age" => 1 }, "$set" => dbm! { "verified" => true } },
            false,
        )
        .unwrap();
    assert_eq!(n, 3);
    assert_eq!(store.count::<User>(&dbm! { "verified" => true }).unwrap(), 3);

    let n = store
        .update_all::<User>(&Dbm::new(), &dbm! { "$max" => dbm! { "age" => 18 } }, true)
        .unwrap();
    assert_eq!(n, 4);
    let jane: User = store.find_one(&dbm! { "name" => "Jane" }).unwrap();
    assert_eq!(jane.age, 18);
}

#[test]
fn test_upsert_zero_match_inserts_exactly_one_row() {
    let store = seeded();
    let before = store.count::<User>(&Dbm::new()).unwrap();

    let mut row = User::default();
    store
        .upsert(
            &mut row,
            &dbm! { "email" => "new@example.com" },
            &dbm! { "$set" => dbm! { "name" => "New" } },
        )
        .unwrap();
    assert_eq!(store.count::<User>(&Dbm::new()).unwrap(), before + 1);
    assert_eq!(row.email, "new@example.com");
    assert_eq!(row.name, "New");
    assert!(row.id.is_some());
}

#[test]
fn test_upsert_one_match_inserts_nothing() {
    let store = seeded();
    let before = store.count::<User>(&Dbm::new()).unwrap();

    let mut row = User::default();
    store
        .upsert(
            &mut row,
            &dbm! { "name" => "John" },
            &dbm! { "$set" => dbm! { "verified" => true } },
        )
        .unwrap();
    assert_eq!(store.count::<User>(&Dbm::new()).unwrap(), before);
    assert_eq!(row.name, "John");
    assert_eq!(row.age, 35);
    assert!(row.verified);
}

#[test]
fn test_upsert_preserves_explicit_identifier() {
    let store = memory_store();
    let id = Identifier::new();
    let mut row = User {
        id: Some(id),
        ..user("Id", 1)
    };
    store
        .upsert(&mut row, &dbm! { "email" => "id@example.com" }, &dbm! { "age" => 2 })
        .unwrap();
    assert_eq!(row.id, Some(id));
    assert_eq!(row.age, 2);
}

#[test]
fn test_bulk_update_mismatch_writes_nothing() {
    let store = seeded();
    let mut rows: Vec<User> = store.find(&dbm! { "_sort" => "age" }).unwrap();
    for row in &mut rows {
        row.age = 0;
    }
    let err = store.bulk_update(&rows, &[dbm! { "name" => "Jane" }]).unwrap_err();
    assert!(matches!(
        err,
        Error::RowFilterCountMismatch {
            rows: 4,
            filters: 1
        }
    ));
    assert_eq!(store.count::<User>(&dbm! { "age" => 0 }).unwrap(), 0);
}

#[test]
fn test_bulk_update_with_filters() {
    let store = seeded();
    let rows = vec![
        User {
            verified: true,
            ..user("Jane", 9)
        },
        user("John", 36),
    ];
    let matched = store
        .bulk_update(&rows, &[dbm! { "name" => "Jane" }, dbm! { "name" => "John" }])
        .unwrap();
    assert_eq!(matched, 2);
    let jane: User = store.find_one(&dbm! { "name" => "Jane" }).unwrap();
    assert_eq!(jane.age, 9);
    assert!(jane.verified);
}

// ============================================================================
// Deletes
// ============================================================================

#[test]
fn test_delete_errors_are_distinct() {
    let store = seeded();
    let no_target = store.delete(&User::default(), None).unwrap_err();
    assert!(matches!(no_target, Error::NoFilter));
    assert!(!is_not_found(&no_target));

    let ghost = User {
        id: Some(Identifier::new()),
        ..User::default()
    };
    let missing = store.delete(&ghost, None).unwrap_err();
    assert!(is_not_found(&missing));

    store
        .delete(&User::default(), Some(&dbm! { "name" => "Jane" }))
        .unwrap();
    assert_eq!(store.count::<User>(&Dbm::new()).unwrap(), 3);
}

// ============================================================================
// Indexes
// ============================================================================

#[test]
fn test_index_descriptors_roundtrip() {
    let store = seeded();
    store
        .create_index("users", &IndexDescriptor::from_keys(&["email"]).unwrap().with_name("by_email"))
        .unwrap();
    store
        .create_index("users", &IndexDescriptor::from_keys(&["$text:name"]).unwrap())
        .unwrap();

    let indexes = store.get_indexes("users").unwrap();
    let by_name: Vec<String> = indexes.iter().map(IndexDescriptor::resolved_name).collect();
    assert!(by_name.contains(&"by_email".to_string()));
    let text = indexes
        .iter()
        .find(|i| i.keys[0].field == "name")
        .expect("text index listed");
    assert_eq!(text.keys[0].kind, IndexKind::Special("text".to_string()));
}

#[test]
fn test_index_validation_happens_first() {
    let store = memory_store();
    let err = store
        .create_index("users", &IndexDescriptor::default())
        .unwrap_err();
    assert!(matches!(err, Error::EmptyIndexKeys));

    let ttl = IndexDescriptor::from_keys(&["a", "b"]).unwrap().with_ttl(30);
    assert!(matches!(
        store.create_index("users", &ttl),
        Err(Error::ComposedTtlIndex)
    ));
    assert!(store.get_indexes("users").unwrap().is_empty());
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Session {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    id: Option<Identifier>,
    token: String,
    created_at: DateTime<Utc>,
}

impl DbObject for Session {
    fn id(&self) -> Option<Identifier> {
        self.id
    }

    fn set_id(&mut self, id: Identifier) {
        self.id = Some(id);
    }

    fn table_name(&self) -> Option<&str> {
        Some("sessions")
    }
}

#[test]
fn test_ttl_index_purges_expired_rows() {
    let store = memory_store();
    let now = Utc::now();
    for (token, age) in [("stale", TimeDelta::hours(2)), ("fresh", TimeDelta::zero())] {
        let mut session = Session {
            id: None,
            token: token.to_string(),
            created_at: now - age,
        };
        store.insert(&mut session).unwrap();
    }
    let ttl = IndexDescriptor::from_keys(&["created_at"]).unwrap().with_ttl(3600);
    store.create_index("sessions", &ttl).unwrap();

    let rows: Vec<Session> = store.find(&Dbm::new()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].token, "fresh");

    let listed = store.get_indexes("sessions").unwrap();
    assert_eq!(listed[0].ttl_seconds, Some(3600));
}

#[test]
fn test_timestamp_ranges_and_sort_ignore_fraction_width() {
    let store = memory_store();
    let base = DateTime::parse_from_rfc3339("2024-01-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    for (token, at) in [
        ("later", base + TimeDelta::milliseconds(500)),
        ("base", base),
        ("earlier", base - TimeDelta::microseconds(1)),
    ] {
        let mut session = Session {
            id: None,
            token: token.to_string(),
            created_at: at,
        };
        store.insert(&mut session).unwrap();
    }

    let after: Vec<Session> = store
        .find(&dbm! { "created_at" => dbm! { "$gt" => base } })
        .unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].token, "later");

    let at_most = store
        .count::<Session>(&dbm! { "created_at" => dbm! { "$lte" => base } })
        .unwrap();
    assert_eq!(at_most, 2);

    let sorted: Vec<Session> = store.find(&dbm! { "_sort" => "created_at" }).unwrap();
    let tokens: Vec<&str> = sorted.iter().map(|s| s.token.as_str()).collect();
    assert_eq!(tokens, ["earlier", "base", "later"]);
    assert_eq!(sorted[1].created_at, base);
    assert_eq!(sorted[2].created_at, base + TimeDelta::milliseconds(500));
}

// ============================================================================
// Persistence and Concurrency
// ============================================================================

#[test]
fn test_file_database_survives_reconnect() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("app.db").display());

    let id = {
        let store = Store::connect(ClientOpts::new(url.clone())).unwrap();
        let id = store.insert(&mut user("Jane", 8)).unwrap();
        store.close().unwrap();
        id
    };

    let store = Store::connect(ClientOpts::new(url)).unwrap();
    let found: User = store.find_by_id(id).unwrap();
    assert_eq!(found.name, "Jane");
}

#[test]
fn test_concurrent_inserts() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("concurrent.db").display());
    let store = Arc::new(Store::connect(ClientOpts::new(url)).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..10 {
                    store.insert(&mut user(&format!("u{t}-{i}"), i)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.count::<User>(&Dbm::new()).unwrap(), 80);
}
