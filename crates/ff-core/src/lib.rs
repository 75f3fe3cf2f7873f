//! Core abstractions for the forms runtime
//!
//! This crate provides the value model, record lifecycle, composable filter
//! structures and the `DataSource` capability trait that the orchestration
//! layer is built on. It knows nothing about concrete backing stores or
//! about how records end up on screen.

pub mod alerts;
pub mod filter;
pub mod record;
pub mod source;
pub mod value;
pub mod view;

use thiserror::Error;

// Re-export commonly used types
pub use filter::{sections, Filter, FilterStructure};
pub use record::{Record, RecordId, RecordState};
pub use source::{DataSource, LockMode, Transactional};
pub use value::Value;
pub use view::{FormView, NullView};

/// Errors raised by datasources and the orchestration layer.
///
/// Fatal contract violations surface as one of these; recoverable
/// operational failures (lost connection, failed describe) are reported as
/// `Ok(false)` / empty results instead, so callers can decide whether to
/// retry or warn.
#[derive(Error, Debug)]
pub enum DataError {
    // Field is deliberately not named `source`: these errors are leaves,
    // not wrappers around an inner error
    #[error("cannot {op} records on datasource '{datasource}'")]
    ReadOnly { op: &'static str, datasource: String },

    #[error("cannot lock records on datasource '{datasource}'")]
    LockingNotSupported { datasource: String },

    #[error("cannot start {event} while {running} is running on {block}")]
    TransactionConflict {
        event: String,
        running: String,
        block: String,
    },

    #[error("unknown block '{0}'")]
    UnknownBlock(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn errors_are_self_contained_leaves() {
        let err = DataError::ReadOnly {
            op: "insert",
            datasource: "orders".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot insert records on datasource 'orders'"
        );
        assert!(err.source().is_none());

        let err = DataError::TransactionConflict {
            event: "ExecuteQuery".into(),
            running: "Flush".into(),
            block: "demo.orders".into(),
        };
        assert!(err.to_string().contains("while Flush is running"));
        assert!(err.source().is_none());
    }
}
