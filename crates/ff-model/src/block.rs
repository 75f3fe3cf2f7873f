//! Block: a named working set of records bound to one datasource

use crate::event_transaction::FormEvent;
use crate::form::FormContext;
use crate::relations::BlockCoordinator;
use ff_core::filter::sections;
use ff_core::{
    alerts, DataError, DataSource, Filter, FilterStructure, LockMode, Record, RecordId,
    RecordState, Value,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Capability flags mirrored from the bound datasource so the view side
/// can consult them without taking the async source lock.
#[derive(Debug, Clone, Copy)]
struct Capabilities {
    query: bool,
    insert: bool,
    update: bool,
    delete: bool,
    locking: LockMode,
}

struct BlockState {
    records: Vec<Record>,
    current: Option<usize>,
    dirty: Vec<RecordId>,
    qbe: Record,
    ctrlblk: bool,
    querymode: bool,
    query_filter: FilterStructure,
    detail_filter: FilterStructure,
}

/// A named, ordered working set of records.
///
/// The block owns its fetched buffer and dirty list; the datasource stages
/// the corresponding mutations and applies them on flush. The back-reference
/// to the form is weak: the form owns its blocks, never the other way
/// around.
pub struct Block {
    name: String,
    ctx: Weak<FormContext>,
    caps: Mutex<Capabilities>,
    source: tokio::sync::Mutex<Box<dyn DataSource>>,
    state: Mutex<BlockState>,
}

impl Block {
    pub(crate) fn new(name: &str, ctx: Weak<FormContext>, source: Box<dyn DataSource>) -> Self {
        let caps = Capabilities {
            query: source.query_allowed(),
            insert: source.insert_allowed(),
            update: source.update_allowed(),
            delete: source.delete_allowed(),
            locking: source.row_locking(),
        };

        let mut qbe = Record::new();
        qbe.set_state(RecordState::QueryFilter);

        Self {
            name: name.to_string(),
            ctx,
            caps: Mutex::new(caps),
            source: tokio::sync::Mutex::new(source),
            state: Mutex::new(BlockState {
                records: Vec::new(),
                current: None,
                dirty: Vec::new(),
                qbe,
                ctrlblk: false,
                querymode: false,
                query_filter: FilterStructure::new(),
                detail_filter: FilterStructure::new(),
            }),
        }
    }

    fn ctx(&self) -> anyhow::Result<Arc<FormContext>> {
        self.ctx
            .upgrade()
            .ok_or_else(|| DataError::Other(format!("block '{}' outlived its form", self.name)).into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Swap the bound datasource. Clears the buffer and dirty list.
    pub async fn set_datasource(&self, source: Box<dyn DataSource>) {
        *self.caps.lock() = Capabilities {
            query: source.query_allowed(),
            insert: source.insert_allowed(),
            update: source.update_allowed(),
            delete: source.delete_allowed(),
            locking: source.row_locking(),
        };

        *self.source.lock().await = source;

        let mut state = self.state.lock();
        state.records.clear();
        state.dirty.clear();
        state.current = None;
    }

    pub fn query_allowed(&self) -> bool {
        self.caps.lock().query
    }

    pub fn insert_allowed(&self) -> bool {
        self.caps.lock().insert
    }

    pub fn update_allowed(&self) -> bool {
        self.caps.lock().update
    }

    pub fn delete_allowed(&self) -> bool {
        self.caps.lock().delete
    }

    pub fn row_locking(&self) -> LockMode {
        self.caps.lock().locking
    }

    pub fn ctrlblk(&self) -> bool {
        self.state.lock().ctrlblk
    }

    pub(crate) fn set_ctrlblk(&self, ctrlblk: bool) {
        self.state.lock().ctrlblk = ctrlblk;
    }

    pub fn querymode(&self) -> bool {
        self.state.lock().querymode
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn records(&self) -> Vec<Record> {
        self.state.lock().records.clone()
    }

    pub fn current_row(&self) -> Option<usize> {
        self.state.lock().current
    }

    pub fn current_record(&self) -> Option<Record> {
        let state = self.state.lock();
        state.current.and_then(|row| state.records.get(row).cloned())
    }

    /// Move the current-row pointer. Master-detail cascading on row change
    /// is driven by the form, which calls this first.
    pub fn set_current_row(&self, row: usize) -> bool {
        let mut state = self.state.lock();
        if row < state.records.len() {
            state.current = Some(row);
            true
        } else {
            false
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.state.lock().dirty.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    /// Forget pending changes without persisting or reverting them.
    pub fn set_clean(&self) {
        self.state.lock().dirty.clear();
    }

    pub fn query_filter(&self) -> FilterStructure {
        self.state.lock().query_filter.clone()
    }

    pub fn detail_filter(&self) -> FilterStructure {
        self.state.lock().detail_filter.clone()
    }

    /// Whether any query-by-example or detail-dependency filter is active.
    /// Surfaced to the view as the filter indicator.
    pub fn has_filters(&self) -> bool {
        let state = self.state.lock();
        !state.query_filter.is_empty() || !state.detail_filter.is_empty()
    }

    pub(crate) fn clear_query_filter(&self) {
        let mut state = self.state.lock();
        state.qbe.clear_values();
        state.query_filter.clear();
    }

    pub(crate) fn clear_detail_filter(&self) {
        self.state.lock().detail_filter.clear();
    }

    /// Field value of the current record, or of the query-by-example
    /// record while in query mode.
    pub fn get_value(&self, column: &str) -> Value {
        let state = self.state.lock();
        if state.querymode {
            return state.qbe.value(column);
        }
        state
            .current
            .and_then(|row| state.records.get(row))
            .map(|rec| rec.value(column))
            .unwrap_or(Value::Null)
    }

    /// Edit a field on the current record. In query mode the edit lands on
    /// the query-by-example record instead. Dirty enqueueing is idempotent;
    /// each change re-stages the record so the source always holds the
    /// latest values.
    pub async fn set_value(&self, column: &str, value: impl Into<Value>) -> anyhow::Result<bool> {
        let ctx = self.ctx()?;
        let value = value.into();

        let staged = {
            let mut state = self.state.lock();

            if state.querymode {
                state.qbe.set_value(column, value);
                return Ok(true);
            }

            let row = match state.current {
                Some(row) => row,
                None => return Ok(false),
            };

            if !state.records[row].set_value(column, value) {
                return Ok(true);
            }

            let record = state.records[row].clone();
            let id = record.id();
            if !state.dirty.contains(&id) {
                state.dirty.push(id);
            }

            record
        };

        {
            let mut source = self.source.lock().await;
            match staged.state() {
                RecordState::New | RecordState::Inserted => source.insert(&staged).await?,
                _ => source.update(&staged).await?,
            };
        }

        ctx.view().record_changed(&self.name, &staged);
        Ok(true)
    }

    /// Create a new record at (or after) the current row and stage it for
    /// insertion.
    pub async fn insert(&self, after: bool) -> anyhow::Result<bool> {
        let ctx = self.ctx()?;

        if !self.insert_allowed() {
            alerts::fatal("Cannot insert records into this datasource", "Datasource");
            return Err(DataError::ReadOnly {
                op: "insert",
                datasource: self.name.clone(),
            }
            .into());
        }

        let columns = self.source.lock().await.columns();

        let record = {
            let mut state = self.state.lock();

            let mut record = Record::new();
            for column in &columns {
                record.set_value(column, Value::Null);
            }
            record.set_block(&self.name);

            let pos = match state.current {
                Some(row) if after => (row + 1).min(state.records.len()),
                Some(row) => row,
                None => state.records.len(),
            };

            state.records.insert(pos, record.clone());
            state.current = Some(pos);
            record
        };

        let mut record = record;
        record.set_state(RecordState::Inserted);
        self.source.lock().await.insert(&record).await?;

        {
            let mut state = self.state.lock();
            let id = record.id();

            if let Some(rec) = state.records.iter_mut().find(|r| r.id() == id) {
                rec.set_state(RecordState::Inserted);
            }
            if !state.dirty.contains(&id) {
                state.dirty.push(id);
            }
        }

        ctx.view().record_changed(&self.name, &record);
        Ok(true)
    }

    /// Mark the current record deleted and stage the delete. The record is
    /// evicted from the buffer when the delete is flushed.
    pub async fn delete(&self) -> anyhow::Result<bool> {
        let ctx = self.ctx()?;

        if !self.delete_allowed() {
            alerts::fatal("Cannot delete records on this datasource", "Datasource");
            return Err(DataError::ReadOnly {
                op: "delete",
                datasource: self.name.clone(),
            }
            .into());
        }

        let record = {
            let mut state = self.state.lock();

            let row = match state.current {
                Some(row) => row,
                None => return Ok(false),
            };

            state.records[row].set_state(RecordState::Deleted);
            let record = state.records[row].clone();

            let id = record.id();
            if !state.dirty.contains(&id) {
                state.dirty.push(id);
            }

            record
        };

        self.source.lock().await.delete(&record).await?;
        ctx.view().record_changed(&self.name, &record);
        Ok(true)
    }

    /// Best-effort row lock on the current record. Sources that cannot
    /// lock reject the call themselves.
    pub async fn lock_current(&self) -> anyhow::Result<bool> {
        let record = match self.current_record() {
            Some(record) => record,
            None => return Ok(false),
        };

        self.source.lock().await.lock(&record).await
    }

    /// Persist all dirty records. Atomic per block: on failure nothing is
    /// cleared and false is reported.
    pub async fn flush(&self) -> anyhow::Result<bool> {
        if !self.is_dirty() {
            return Ok(true);
        }

        let processed = match self.source.lock().await.flush().await {
            Ok(processed) => processed,
            Err(err) => {
                alerts::warning(
                    &format!("Failed to flush block '{}': {err}", self.name),
                    "Transactions",
                );
                return Ok(false);
            }
        };

        let mut state = self.state.lock();

        for record in &processed {
            match record.state() {
                RecordState::Inserted | RecordState::Updated => {
                    if let Some(rec) = state.records.iter_mut().find(|r| r.id() == record.id()) {
                        rec.set_bound(true);
                        rec.mark_consistent();
                    }
                }
                RecordState::Deleted => {
                    if let Some(idx) = state.records.iter().position(|r| r.id() == record.id()) {
                        state.records.remove(idx);

                        state.current = match state.current {
                            Some(_) if state.records.is_empty() => None,
                            Some(cur) if cur > idx => Some(cur - 1),
                            Some(cur) => Some(cur.min(state.records.len() - 1)),
                            None => None,
                        };
                    }
                }
                _ => {}
            }
        }

        state.dirty.clear();
        Ok(true)
    }

    /// Revert all dirty records to their pre-edit values. New/Inserted
    /// records disappear from the buffer.
    pub async fn undo(&self) -> anyhow::Result<bool> {
        if !self.is_dirty() {
            return Ok(true);
        }

        let undone = self.source.lock().await.undo().await?;

        let mut state = self.state.lock();

        for record in undone {
            match record.state() {
                RecordState::Deleted => {
                    // Was never flushed; discard entirely
                    if let Some(idx) = state.records.iter().position(|r| r.id() == record.id()) {
                        state.records.remove(idx);

                        state.current = match state.current {
                            Some(_) if state.records.is_empty() => None,
                            Some(cur) if cur > idx => Some(cur - 1),
                            Some(cur) => Some(cur.min(state.records.len() - 1)),
                            None => None,
                        };
                    }
                }
                RecordState::Consistent => {
                    if let Some(rec) = state.records.iter_mut().find(|r| r.id() == record.id()) {
                        *rec = record;
                        rec.mark_consistent();
                        rec.set_bound(true);
                    }
                }
                other => {
                    warn!(block = %self.name, state = ?other, "unexpected state after undo");
                }
            }
        }

        state.dirty.clear();
        Ok(true)
    }

    /// Enter query-by-example mode: present a blank criteria record.
    pub(crate) fn enter_query(&self) -> bool {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return false,
        };

        {
            let mut state = self.state.lock();
            if state.ctrlblk {
                return false;
            }
            state.querymode = true;
            state.qbe.clear_values();
        }

        ctx.view().clear(&self.name, true, false);
        true
    }

    /// Leave query mode without executing.
    pub(crate) fn cancel_query(&self) {
        self.state.lock().querymode = false;
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.view().cancel(&self.name);
        }
    }

    /// Drop the fetched buffer and clear the display.
    pub(crate) fn clear_display(&self) {
        {
            let mut state = self.state.lock();
            state.records.clear();
            state.current = None;
        }
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.view().clear(&self.name, true, true);
        }
    }

    /// Pre-query hook. Runs under the block's event-transaction slot so a
    /// handler cannot start a competing operation mid-query.
    pub(crate) async fn pre_query(&self) -> anyhow::Result<bool> {
        let ctx = self.ctx()?;

        if let Err(running) = ctx
            .event_transaction()
            .start(FormEvent::PreQuery, &self.name, None)
        {
            alerts::fatal(
                &format!(
                    "Cannot start transaction {} while running {} on {}",
                    FormEvent::PreQuery,
                    running,
                    self.name
                ),
                "Transaction Violation",
            );
            return Err(DataError::TransactionConflict {
                event: FormEvent::PreQuery.to_string(),
                running: running.to_string(),
                block: self.name.clone(),
            }
            .into());
        }

        ctx.event_transaction().finish(&self.name);
        Ok(true)
    }

    /// Rebuild the detail-dependency filter from this block's master links
    /// and their current rows. Returns false when a link forbids
    /// master-less queries and the master has no current row; the caller
    /// must then exclude this block from the cascade.
    pub(crate) async fn set_detail_dependencies(&self) -> anyhow::Result<bool> {
        let ctx = self.ctx()?;
        let links = ctx.coordinator().get_master_links(&self.name);

        let mut filter = FilterStructure::new();

        for link in links {
            let master = ctx
                .block(&link.master)
                .ok_or_else(|| DataError::UnknownBlock(link.master.clone()))?;

            match master.current_record() {
                Some(row) => {
                    filter.and(BlockCoordinator::join_filter(&link, &row));
                }
                None => {
                    if !link.allow_master_less {
                        self.state.lock().detail_filter.clear();
                        return Ok(false);
                    }
                }
            }
        }

        self.state.lock().detail_filter = filter;
        Ok(true)
    }

    /// Translate the query-by-example record into the block's query filter.
    /// Text criteria containing wildcards become LIKE predicates.
    fn take_qbe_criteria(state: &mut BlockState) {
        let mut filter = FilterStructure::new();

        let columns: Vec<String> = state.qbe.columns().map(|c| c.to_string()).collect();
        for column in columns {
            let value = state.qbe.value(&column);
            if value.is_null() {
                continue;
            }

            let leaf = match &value {
                Value::Text(text) if text.contains('%') || text.contains('_') => {
                    Filter::like(&column, text)
                }
                _ => Filter::Equals {
                    column: column.clone(),
                    value,
                },
            };

            filter.and(leaf);
        }

        state.query_filter = filter;
        state.querymode = false;
    }

    /// Execute a query under a chain id.
    ///
    /// The combined filter is assembled from the query-by-example and
    /// detail-dependency filters; batches arriving after a newer chain id
    /// has been issued are discarded without touching the buffer.
    pub async fn execute_query(&self, chain: u64) -> anyhow::Result<bool> {
        let ctx = self.ctx()?;

        if !self.query_allowed() {
            return Ok(false);
        }

        let filter = {
            let mut state = self.state.lock();

            if state.querymode {
                Self::take_qbe_criteria(&mut state);
            }

            let mut filter = FilterStructure::named(&self.name);
            filter.and_structure(sections::QBE, state.query_filter.clone());
            filter.and_structure(sections::MASTERS, state.detail_filter.clone());
            filter
        };

        ctx.query_manager().begin(&self.name);
        let result = self.run_query(&ctx, chain, filter).await;
        ctx.query_manager().end(&self.name);

        result
    }

    async fn run_query(
        &self,
        ctx: &Arc<FormContext>,
        chain: u64,
        filter: FilterStructure,
    ) -> anyhow::Result<bool> {
        let mut source = self.source.lock().await;

        source.close_cursor().await?;

        if !source.query(filter).await? {
            return Ok(false);
        }

        let mut applied = false;

        loop {
            let batch = source.fetch().await?;

            // A newer chain supersedes this query: leave the buffer as it
            // is and let the fresher cascade populate it.
            if ctx.query_manager().query_id() != chain {
                debug!(block = %self.name, chain, "discarding stale query result");
                return Ok(false);
            }

            if batch.is_empty() {
                break;
            }

            let mut state = self.state.lock();

            if !applied {
                state.records.clear();
                state.current = None;
                applied = true;
            }

            for mut record in batch {
                record.set_bound(true);
                record.set_block(&self.name);
                record.mark_consistent();
                state.records.push(record);
            }

            if state.current.is_none() && !state.records.is_empty() {
                state.current = Some(0);
            }
        }

        if !applied {
            // Empty result set still replaces whatever was displayed
            let mut state = self.state.lock();
            state.records.clear();
            state.current = None;
        }

        source.close_cursor().await?;
        Ok(true)
    }
}
