//! Datasource capability trait

use crate::filter::FilterStructure;
use crate::record::Record;
use async_trait::async_trait;

/// Row-locking behavior a datasource can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    Row,
}

/// Abstraction over a backing store.
///
/// Implementations stage mutations locally and apply them on `flush()`.
/// Recoverable operational failures (lost connection, failed describe)
/// are reported as `Ok(false)` or empty results; `Err` is reserved for
/// contract violations such as mutating a read-only source.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Column names this source produces, lowercase.
    fn columns(&self) -> Vec<String>;

    fn query_allowed(&self) -> bool {
        true
    }

    fn insert_allowed(&self) -> bool {
        true
    }

    fn update_allowed(&self) -> bool {
        true
    }

    fn delete_allowed(&self) -> bool {
        true
    }

    fn row_locking(&self) -> LockMode {
        LockMode::None
    }

    /// Open a logical cursor scoped to `filter`, resetting any previous
    /// cursor. `Ok(false)` signals a non-fatal connectivity or describe
    /// failure.
    async fn query(&mut self, filter: FilterStructure) -> anyhow::Result<bool>;

    /// Next batch of the open cursor. The sequence is finite and
    /// non-restartable; an empty batch signals exhaustion. Residual
    /// filtering happens transparently before rows are returned.
    async fn fetch(&mut self) -> anyhow::Result<Vec<Record>>;

    /// Stage an insert. Idempotent per record until flushed.
    async fn insert(&mut self, record: &Record) -> anyhow::Result<bool>;

    /// Stage an update. Idempotent per record until flushed.
    async fn update(&mut self, record: &Record) -> anyhow::Result<bool>;

    /// Stage a delete. Idempotent per record until flushed.
    async fn delete(&mut self, record: &Record) -> anyhow::Result<bool>;

    /// Durably apply all staged mutations in insertion order. Returns the
    /// affected records; on failure the whole batch is reported failed and
    /// nothing is cleared.
    async fn flush(&mut self) -> anyhow::Result<Vec<Record>>;

    /// Revert staged, unflushed mutations. New/Inserted records are
    /// discarded entirely; Updated/Deleted return to consistent.
    async fn undo(&mut self) -> anyhow::Result<Vec<Record>>;

    /// Best-effort row lock. Sources that cannot lock fail fatally.
    async fn lock(&mut self, record: &Record) -> anyhow::Result<bool>;

    /// Restore a record to the source's view of it.
    async fn refresh(&self, record: &mut Record) -> anyhow::Result<bool>;

    /// Release the open cursor. Safe to call when none is open.
    async fn close_cursor(&mut self) -> anyhow::Result<bool>;
}

/// A committable external resource, typically a database connection.
/// `Form::save` commits every registered one that is connected.
#[async_trait]
pub trait Transactional: Send + Sync {
    fn connected(&self) -> bool {
        true
    }

    async fn commit(&self) -> bool;
}
