//! Storage backend traits.

mod backend;
mod connector;

pub use backend::{Backend, DbType};
pub use connector::Connector;
