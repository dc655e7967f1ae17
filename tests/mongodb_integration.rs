//! `MongoDB` Integration Tests
//!
//! Runs the typed store against a live document server, focusing on:
//! - Identifier routing and operator semantics in compiled BSON filters
//! - Native upsert with `$setOnInsert` seed fields
//! - Index descriptors and TTL options
//! - Server flavor detection and close semantics
//!
//! These tests require a running `MongoDB` server. Set the environment variable
//! `POLYSTORE_TEST_MONGODB_URL` to enable these tests:
//!
//! ```bash
//! export POLYSTORE_TEST_MONGODB_URL="mongodb://localhost:27017/polystore_test"
//! cargo test --features mongodb mongodb_integration
//! ```

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::print_stderr
)]
#![cfg(feature = "mongodb")]

use polystore::models::{DbObject, Identifier};
use polystore::{ClientOpts, Dbm, DbType, Error, IndexDescriptor, Store, dbm, is_not_found};
use serde::{Deserialize, Serialize};
use std::env;

/// Environment variable for the `MongoDB` test connection URL.
const MONGODB_URL_ENV: &str = "POLYSTORE_TEST_MONGODB_URL";

/// Returns the connection URL if available, or None to skip tests.
fn get_mongodb_url() -> Option<String> {
    env::var(MONGODB_URL_ENV).ok()
}

/// Macro to skip tests when `MongoDB` is not available.
macro_rules! require_mongodb {
    () => {
        match get_mongodb_url() {
            Some(url) => url,
            None => {
                eprintln!(
                    "Skipping test: {} not set. Set this environment variable to run MongoDB tests.",
                    MONGODB_URL_ENV
                );
                return;
            },
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Account {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    id: Option<Identifier>,
    email: String,
    plan: String,
    logins: i64,
}

impl DbObject for Account {
    fn id(&self) -> Option<Identifier> {
        self.id
    }

    fn set_id(&mut self, id: Identifier) {
        self.id = Some(id);
    }

    fn table_name(&self) -> Option<&str> {
        Some("accounts")
    }
}

/// Connects and routes every call to a collection unique to this test.
fn connect(url: &str) -> (Store, String) {
    let store = Store::connect(ClientOpts::new(url)).unwrap();
    let collection = format!("accounts_{}", Identifier::new().hex());
    (store, collection)
}

fn scoped(collection: &str, mut filter: Dbm) -> Dbm {
    filter.insert("_collection".into(), collection.into());
    filter
}

fn account(email: &str) -> Account {
    Account {
        email: email.to_string(),
        plan: "free".to_string(),
        ..Account::default()
    }
}

#[test]
fn test_insert_and_find_by_identifier_list() {
    let url = require_mongodb!();
    let (store, coll) = connect(&url);

    let mut a = account("a@x");
    let mut b = account("b@x");
    store.insert_into(Some(&coll), &mut a).unwrap();
    store.insert_into(Some(&coll), &mut b).unwrap();
    store.insert_into(Some(&coll), &mut account("c@x")).unwrap();

    let rows: Vec<Account> = store
        .find(&scoped(
            &coll,
            dbm! {
                "_id" => vec![a.id.unwrap().hex(), b.id.unwrap().hex()],
                "_sort" => "email",
            },
        ))
        .unwrap();
    assert_eq!(rows, [a, b]);

    store.delete_all::<Account>(&scoped(&coll, Dbm::new()), true).unwrap();
}

#[test]
fn test_operator_semantics() {
    let url = require_mongodb!();
    let (store, coll) = connect(&url);
    for email in ["a.b*c@x", "abbc@x", "Mary@x"] {
        store.insert_into(Some(&coll), &mut account(email)).unwrap();
    }

    let literal: Vec<Account> = store
        .find(&scoped(&coll, dbm! { "email" => dbm! { "$i" => "A.B*C@X" } }))
        .unwrap();
    assert_eq!(literal.len(), 1);
    assert_eq!(literal[0].email, "a.b*c@x");

    let substring = store
        .count::<Account>(&scoped(&coll, dbm! { "email" => dbm! { "$text" => "ARY" } }))
        .unwrap();
    assert_eq!(substring, 1);

    store.delete_all::<Account>(&scoped(&coll, Dbm::new()), true).unwrap();
}

#[test]
fn test_upsert_inserts_then_updates() {
    let url = require_mongodb!();
    let (store, coll) = connect(&url);
    let filter = scoped(&coll, dbm! { "email" => "new@x" });
    let update = dbm! { "$inc" => dbm! { "logins" => 1 } };

    let mut first = Account {
        plan: "trial".to_string(),
        ..Account::default()
    };
    store.upsert(&mut first, &filter, &update).unwrap();
    assert_eq!(first.email, "new@x");
    assert_eq!(first.plan, "trial");
    assert_eq!(first.logins, 1);

    let mut second = Account::default();
    store.upsert(&mut second, &filter, &update).unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.logins, 2);
    assert_eq!(second.plan, "trial", "seed applies only on insert");
    assert_eq!(store.count::<Account>(&scoped(&coll, Dbm::new())).unwrap(), 1);

    store.delete_all::<Account>(&scoped(&coll, Dbm::new()), true).unwrap();
}

#[test]
fn test_update_and_delete_by_identifier() {
    let url = require_mongodb!();
    let (store, coll) = connect(&url);
    let mut row = account("u@x");
    store.insert_into(Some(&coll), &mut row).unwrap();

    row.plan = "pro".to_string();
    store.update(&row, &[scoped(&coll, Dbm::new())]).unwrap();
    let found: Account = store
        .find_one(&scoped(&coll, dbm! { "_id" => row.id.unwrap() }))
        .unwrap();
    assert_eq!(found.plan, "pro");

    store.delete(&row, Some(&scoped(&coll, Dbm::new()))).unwrap();
    let err = store.delete(&row, Some(&scoped(&coll, Dbm::new()))).unwrap_err();
    assert!(is_not_found(&err));
}

#[test]
fn test_bulk_update_by_filters() {
    let url = require_mongodb!();
    let (store, coll) = connect(&url);
    store.insert_into(Some(&coll), &mut account("a@x")).unwrap();
    store.insert_into(Some(&coll), &mut account("b@x")).unwrap();

    let rows = [
        Account {
            plan: "pro".into(),
            ..account("a@x")
        },
        Account {
            plan: "team".into(),
            ..account("b@x")
        },
    ];
    let matched = store
        .bulk_update(
            &rows,
            &[
                scoped(&coll, dbm! { "email" => "a@x" }),
                dbm! { "email" => "b@x" },
            ],
        )
        .unwrap();
    assert_eq!(matched, 2);
    assert_eq!(
        store
            .count::<Account>(&scoped(&coll, dbm! { "plan" => vec!["pro", "team"] }))
            .unwrap(),
        2
    );

    let err = store.bulk_update(&rows, &[dbm! { "email" => "a@x" }]);
    assert!(matches!(err, Err(Error::RowFilterCountMismatch { .. })));

    store.delete_all::<Account>(&scoped(&coll, Dbm::new()), true).unwrap();
}

#[test]
fn test_indexes_roundtrip() {
    let url = require_mongodb!();
    let (store, coll) = connect(&url);
    store.insert_into(Some(&coll), &mut account("i@x")).unwrap();

    store
        .create_index(&coll, &IndexDescriptor::from_keys(&["email", "-logins"]).unwrap())
        .unwrap();
    store
        .create_index(
            &coll,
            &IndexDescriptor::from_keys(&["created"]).unwrap().with_ttl(60),
        )
        .unwrap();

    let indexes = store.get_indexes(&coll).unwrap();
    assert_eq!(indexes.len(), 2);
    assert!(indexes.iter().any(|i| i.resolved_name() == "email_1_logins_-1"));
    assert!(indexes.iter().any(|i| i.ttl_seconds == Some(60)));

    store.delete_all::<Account>(&scoped(&coll, Dbm::new()), true).unwrap();
}

#[test]
fn test_db_type_and_close() {
    let url = require_mongodb!();
    let (store, _) = connect(&url);
    assert!(matches!(
        store.db_type().unwrap(),
        DbType::MongoDb | DbType::CosmosDb | DbType::DocumentDb
    ));
    store.close().unwrap();
    assert!(matches!(store.close(), Err(Error::AlreadyClosed)));
    assert!(matches!(store.ping(), Err(Error::SessionClosed)));
}
