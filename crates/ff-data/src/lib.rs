//! Reference datasource implementations
//!
//! Two implementations of the `ff-core` [`DataSource`](ff_core::DataSource)
//! trait: an in-memory table with transactional staging and local filtering,
//! and a cursor-backed table over an opaque [`Connection`] to a remote
//! backing store.

pub mod connection;
pub mod memory;
pub mod query_table;

// Re-exports
pub use connection::{BindValue, Connection, Cursor, DataType, FetchResponse, SelectResponse, Statement};
pub use memory::MemoryTable;
pub use query_table::QueryTable;
