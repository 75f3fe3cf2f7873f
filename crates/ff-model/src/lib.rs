//! Query/transaction orchestration for forms
//!
//! A [`Form`] aggregates named [`Block`]s, each bound to one datasource.
//! The per-form [`QueryManager`], [`BlockCoordinator`] and
//! [`EventTransaction`] implement stale-result suppression, master-detail
//! cascading and mutual exclusion of competing form-level operations.

pub mod block;
pub mod event_transaction;
pub mod form;
pub mod relations;

// Re-export commonly used types
pub use block::Block;
pub use event_transaction::{EventTransaction, FormEvent};
pub use form::{Form, FormContext};
pub use relations::{BlockCoordinator, Link, QueryManager};
