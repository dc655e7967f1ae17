//! High-level services.
//!
//! Services wire the storage layer into the typed API applications use.

mod backend_factory;
mod store;

pub use backend_factory::BackendFactory;
pub use store::Store;
