//! Data models for polystore.
//!
//! This module contains the value types shared by every backend: identifiers,
//! the query model, index descriptors and the record capability traits.

mod dbm;
mod id;
mod index;
mod object;

pub use dbm::{Dbm, Value, dbm_from_json, dbm_to_json};
pub use id::{HEX_LEN, ID_LEN, Identifier};
pub use index::{IndexDescriptor, IndexKey, IndexKind};
pub use object::{DbObject, FieldKind, ID_FIELD, Record, Schema, from_dbm, to_dbm};
