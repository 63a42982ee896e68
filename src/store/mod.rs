//! Persistence layer: libSQL-backed, namespace-partitioned task storage.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlTaskStore;
pub use traits::TaskStore;
