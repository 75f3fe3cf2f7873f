//! Form: block aggregation and the top-level protocols

use crate::block::Block;
use crate::event_transaction::{EventTransaction, FormEvent};
use crate::relations::{BlockCoordinator, Link, QueryManager};
use ff_core::{alerts, DataError, DataSource, FormView, Transactional};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Per-form shared state: the query manager, coordinator and event
/// transaction live exactly as long as the form, and the block index is
/// how back-references (record -> block, block -> form) are resolved.
/// There is no process-wide registry.
pub struct FormContext {
    name: String,
    view: Box<dyn FormView>,
    query_manager: QueryManager,
    coordinator: BlockCoordinator,
    event_transaction: EventTransaction,
    blocks: RwLock<IndexMap<String, Arc<Block>>>,
    transactions: Mutex<Vec<Arc<dyn Transactional>>>,
}

impl FormContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn view(&self) -> &dyn FormView {
        self.view.as_ref()
    }

    pub fn query_manager(&self) -> &QueryManager {
        &self.query_manager
    }

    pub fn coordinator(&self) -> &BlockCoordinator {
        &self.coordinator
    }

    pub fn event_transaction(&self) -> &EventTransaction {
        &self.event_transaction
    }

    pub fn block(&self, name: &str) -> Option<Arc<Block>> {
        self.blocks.read().get(&name.to_lowercase()).cloned()
    }

    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.blocks.read().values().cloned().collect()
    }
}

/// Releases an event-transaction slot when the guarded operation ends,
/// on every path.
struct EventGuard<'a> {
    transaction: &'a EventTransaction,
    block: String,
}

impl Drop for EventGuard<'_> {
    fn drop(&mut self) {
        self.transaction.finish(&self.block);
    }
}

/// Aggregates blocks over one shared [`FormContext`] and implements the
/// enter-query / execute-query / undo / flush / save protocols.
pub struct Form {
    ctx: Arc<FormContext>,
}

impl Form {
    pub fn new(name: &str, view: Box<dyn FormView>) -> Self {
        Self {
            ctx: Arc::new(FormContext {
                name: name.to_string(),
                view,
                query_manager: QueryManager::new(),
                coordinator: BlockCoordinator::new(),
                event_transaction: EventTransaction::new(),
                blocks: RwLock::new(IndexMap::new()),
                transactions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn context(&self) -> &Arc<FormContext> {
        &self.ctx
    }

    pub fn query_manager(&self) -> &QueryManager {
        self.ctx.query_manager()
    }

    pub fn coordinator(&self) -> &BlockCoordinator {
        self.ctx.coordinator()
    }

    pub fn event_transaction(&self) -> &EventTransaction {
        self.ctx.event_transaction()
    }

    /// Create a block bound to `source`. Block names are case-insensitive.
    pub fn add_block(&self, name: &str, source: Box<dyn DataSource>) -> Arc<Block> {
        let name = name.to_lowercase();
        let block = Arc::new(Block::new(&name, Arc::downgrade(&self.ctx), source));
        self.ctx.blocks.write().insert(name, block.clone());
        block
    }

    /// Create a memory-only control block. Control blocks are never
    /// queried against a real backing store.
    pub fn add_control_block(&self, name: &str, source: Box<dyn DataSource>) -> Arc<Block> {
        let block = self.add_block(name, source);
        block.set_ctrlblk(true);
        block
    }

    /// Populate every control block from its memory source.
    pub async fn init_control_blocks(&self) -> anyhow::Result<()> {
        for block in self.ctx.blocks() {
            if block.ctrlblk() {
                let chain = self.ctx.query_manager().start_new_chain();
                block.execute_query(chain).await?;
            }
        }
        Ok(())
    }

    pub fn block(&self, name: &str) -> Option<Arc<Block>> {
        self.ctx.block(name)
    }

    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.ctx.blocks()
    }

    /// Register a master-detail link. Both blocks must exist.
    pub fn link(&self, link: Link) -> anyhow::Result<()> {
        for name in [&link.master, &link.detail] {
            if self.ctx.block(name).is_none() {
                return Err(DataError::UnknownBlock(name.clone()).into());
            }
        }
        self.ctx.coordinator().link(link)
    }

    /// Register a committable backing connection for `save()`.
    pub fn register_transaction(&self, transaction: Arc<dyn Transactional>) {
        self.ctx.transactions.lock().push(transaction);
    }

    pub fn dirty_count(&self) -> usize {
        self.ctx.blocks().iter().map(|b| b.dirty_count()).sum()
    }

    pub fn set_clean(&self) {
        for block in self.ctx.blocks() {
            block.set_clean();
        }
    }

    fn start_event(&self, event: FormEvent, block: &str) -> anyhow::Result<EventGuard<'_>> {
        match self.ctx.event_transaction().start(event, block, None) {
            Ok(()) => Ok(EventGuard {
                transaction: self.ctx.event_transaction(),
                block: block.to_string(),
            }),
            Err(running) => {
                alerts::fatal(
                    &format!(
                        "Cannot start transaction {} while running {} on {}.{}",
                        event,
                        running,
                        self.ctx.name(),
                        block
                    ),
                    "Transaction Violation",
                );
                Err(DataError::TransactionConflict {
                    event: event.to_string(),
                    running: running.to_string(),
                    block: format!("{}.{}", self.ctx.name(), block),
                }
                .into())
            }
        }
    }

    /// Flush every block's pending changes. Atomic per block, not across
    /// blocks: the first failing block stops the pass and reports false.
    pub async fn flush(&self) -> anyhow::Result<bool> {
        for block in self.ctx.blocks() {
            let _slot = self.start_event(FormEvent::Flush, block.name())?;
            if !block.flush().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Undo every dirty block, then requery only the top-level dirty
    /// blocks; their cascades implicitly refresh the dirty descendants.
    pub async fn undo(&self) -> anyhow::Result<bool> {
        let dirty: Vec<Arc<Block>> = self
            .ctx
            .blocks()
            .into_iter()
            .filter(|b| b.is_dirty())
            .collect();

        for block in &dirty {
            let _slot = self.start_event(FormEvent::Undo, block.name())?;
            if !block.undo().await? {
                return Ok(false);
            }
        }

        // Top-level subset: drop every dirty block that is a transitive
        // detail of another dirty block
        let mut top: Vec<String> = dirty.iter().map(|b| b.name().to_string()).collect();
        for block in &dirty {
            for detail in self
                .ctx
                .coordinator()
                .get_detail_blocks(block.name(), true)
            {
                top.retain(|name| name != &detail);
            }
        }

        for name in &top {
            let chain = self.ctx.query_manager().start_new_chain();
            if !self.query_cascade(name.clone(), chain).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Validate the view and commit every registered connection. The
    /// outcome is reported as a user-facing message, not an error.
    pub async fn save(&self) -> anyhow::Result<bool> {
        if !self.ctx.view().validate().await {
            return Ok(false);
        }

        let transactions: Vec<Arc<dyn Transactional>> =
            self.ctx.transactions.lock().clone();

        let mut committed = true;
        for transaction in transactions {
            if transaction.connected() && !transaction.commit().await {
                committed = false;
            }
        }

        if committed {
            alerts::message("Transactions successfully saved", "Transactions");
        } else {
            alerts::warning("Failed to commit transactions", "Transactions");
        }

        Ok(committed)
    }

    /// Enter query-by-example mode on a block and every master-less
    /// eligible detail under it.
    pub async fn enter_query(&self, block: &str) -> anyhow::Result<bool> {
        let blk = match self.ctx.block(block) {
            Some(blk) => blk,
            None => return Ok(false),
        };

        if blk.ctrlblk() || !blk.query_allowed() {
            return Ok(false);
        }

        self.ctx.query_manager().stop_all_queries();

        // Wait for superseded queries to finish displaying rows
        while self.ctx.query_manager().has_running() {
            QueryManager::sleep().await;
        }

        if !self.ctx.view().validate().await {
            return Ok(false);
        }

        if !self.flush().await? {
            return Ok(false);
        }

        if !self.ctx.coordinator().allow_query_mode(blk.name()) {
            return Ok(false);
        }

        if !self.ctx.view().has_queryable_fields(blk.name()) {
            return Ok(false);
        }

        self.clear_detail_dependencies(blk.name());
        self.enter_query_mode(blk.name());
        Ok(true)
    }

    /// Leave query mode on a block and its master-less eligible details
    /// without executing.
    pub fn cancel_query_mode(&self, block: &str) {
        let blk = match self.ctx.block(block) {
            Some(blk) => blk,
            None => return,
        };

        blk.cancel_query();

        for detail in self.ctx.coordinator().get_detail_blocks(block, false) {
            if self.ctx.coordinator().allow_master_less(block, &detail) {
                self.cancel_query_mode(&detail);
            }
        }
    }

    /// Execute a query from a block, cascading into its details.
    ///
    /// If the block is in query mode the query is issued from its query
    /// master instead. Unless `keep` is set, previous query-by-example and
    /// detail-dependency filters are cleared first.
    pub async fn execute_query(&self, block: &str, keep: bool) -> anyhow::Result<bool> {
        let blk = match self.ctx.block(block) {
            Some(blk) => blk,
            None => return Ok(false),
        };

        if blk.ctrlblk() || !blk.query_allowed() {
            return Ok(false);
        }

        if !self.ctx.view().validate().await {
            return Ok(false);
        }

        if !self.flush().await? {
            return Ok(false);
        }

        let target = if blk.querymode() {
            self.ctx.coordinator().get_query_master(blk.name())
        } else {
            if !keep {
                self.clear_query_filters(blk.name());
                self.clear_detail_dependencies(blk.name());
            }
            blk.name().to_string()
        };

        let target_blk = match self.ctx.block(&target) {
            Some(blk) => blk,
            None => return Ok(false),
        };

        self.ctx.query_manager().set_query_master(&target);
        self.ctx
            .view()
            .set_filter_indicator(&target, target_blk.has_filters());

        for detail in self.ctx.coordinator().get_detail_blocks(&target, true) {
            let detail_blk = match self.ctx.block(&detail) {
                Some(blk) => blk,
                None => continue,
            };

            self.ctx.view().clear(&detail, true, true);

            if !detail_blk.pre_query().await? {
                return Ok(false);
            }

            if !detail_blk.set_detail_dependencies().await? {
                // Strictly bound with no master row; recomputed again as
                // the cascade descends, after the master has fresh rows
                self.ctx.view().set_filter_indicator(&detail, false);
                continue;
            }

            self.ctx
                .view()
                .set_filter_indicator(&detail, detail_blk.has_filters());
        }

        let chain = self.ctx.query_manager().start_new_chain();
        self.query_cascade(target, chain).await
    }

    /// Requery only the details joined on one master column, e.g. after
    /// a single field changed.
    pub async fn query_field_details(&self, block: &str, field: &str) -> anyhow::Result<bool> {
        let chain = self.ctx.query_manager().start_new_chain();

        for detail in self
            .ctx
            .coordinator()
            .get_detail_blocks_for_field(block, field)
        {
            if !self.query_cascade(detail, chain).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Move a block's current row and cascade the change into its details.
    pub async fn select_row(&self, block: &str, row: usize) -> anyhow::Result<bool> {
        let blk = match self.ctx.block(block) {
            Some(blk) => blk,
            None => return Ok(false),
        };

        if !blk.set_current_row(row) {
            return Ok(false);
        }

        let chain = self.ctx.query_manager().start_new_chain();

        for detail in self.ctx.coordinator().get_detail_blocks(block, false) {
            if !self.query_cascade(detail, chain).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Clear a block's buffer and display, cascading into its details.
    pub fn clear_block(&self, block: &str) {
        if let Some(blk) = self.ctx.block(block) {
            blk.clear_display();
        }

        for detail in self.ctx.coordinator().get_detail_blocks(block, false) {
            self.clear_block(&detail);
        }
    }

    fn clear_query_filters(&self, block: &str) {
        if let Some(blk) = self.ctx.block(block) {
            blk.clear_query_filter();
        }
        for detail in self.ctx.coordinator().get_detail_blocks(block, true) {
            if let Some(blk) = self.ctx.block(&detail) {
                blk.clear_query_filter();
            }
        }
    }

    fn clear_detail_dependencies(&self, block: &str) {
        if let Some(blk) = self.ctx.block(block) {
            blk.clear_detail_filter();
        }
        for detail in self.ctx.coordinator().get_detail_blocks(block, true) {
            if let Some(blk) = self.ctx.block(&detail) {
                blk.clear_detail_filter();
            }
        }
    }

    fn enter_query_mode(&self, block: &str) {
        let blk = match self.ctx.block(block) {
            Some(blk) => blk,
            None => return,
        };

        if !blk.enter_query() {
            return;
        }

        for detail in self.ctx.coordinator().get_detail_blocks(block, false) {
            if self.ctx.coordinator().allow_master_less(block, &detail) {
                self.enter_query_mode(&detail);
            }
        }
    }

    /// Depth-first query cascade under one chain id. Each level awaits its
    /// children in order; there is no fan-out inside a cascade.
    fn query_cascade(
        &self,
        block: String,
        chain: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let blk = match self.ctx.block(&block) {
                Some(blk) => blk,
                None => return Ok(false),
            };

            if !blk.set_detail_dependencies().await? {
                // Strictly bound detail with no master row: excluded from
                // the cascade, and stale child rows must not outlive the
                // vanished parent
                debug!(block = %block, "skipping master-less detail");
                self.clear_block(&block);
                return Ok(true);
            }

            if !blk.execute_query(chain).await? {
                return Ok(false);
            }

            // Superseded mid-cascade: the newer chain owns the descent
            if self.ctx.query_manager().query_id() != chain {
                return Ok(false);
            }

            for detail in self.ctx.coordinator().get_detail_blocks(&block, false) {
                if !self.query_cascade(detail, chain).await? {
                    return Ok(false);
                }
            }

            Ok(true)
        })
    }
}
