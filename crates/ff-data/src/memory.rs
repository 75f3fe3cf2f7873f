//! In-memory table datasource

use async_trait::async_trait;
use ff_core::{DataSource, Filter, FilterStructure, LockMode, Record, RecordState, Value};
use ff_core::filter::sections;

/// One key of a multi-key sort order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    pub column: String,
    pub ascending: bool,
}

impl SortOrder {
    /// Parse `"column [asc|desc], ..."`. Column names are case-insensitive;
    /// empty segments are skipped.
    pub fn parse(order: &str) -> Vec<SortOrder> {
        let mut sorting = Vec::new();

        for part in order.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut tokens = part.split_whitespace();
            let column = match tokens.next() {
                Some(column) => column.to_lowercase(),
                None => continue,
            };

            let ascending = !matches!(
                tokens.next().map(|t| t.to_lowercase()).as_deref(),
                Some("desc")
            );

            sorting.push(SortOrder { column, ascending });
        }

        sorting
    }
}

/// Fully in-memory datasource.
///
/// Records live in insertion order; `query()` captures the caller filter
/// combined with the static limit filter and resets the cursor, `fetch()`
/// returns the next matching record, one per call. Mutations are staged
/// on a dirty list and applied by `flush()`.
pub struct MemoryTable {
    name: String,
    columns: Vec<String>,
    records: Vec<Record>,
    staged: Vec<Record>,
    pos: usize,
    order: Option<String>,
    sorting: Vec<SortOrder>,
    limit: FilterStructure,
    filter: FilterStructure,
}

impl MemoryTable {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            name: "memory".to_string(),
            columns: columns.iter().map(|c| c.to_lowercase()).collect(),
            records: Vec::new(),
            staged: Vec::new(),
            pos: 0,
            order: None,
            sorting: Vec::new(),
            limit: FilterStructure::new(),
            filter: FilterStructure::new(),
        }
    }

    /// Build a table pre-populated with rows. Rows become bound,
    /// consistent records immediately.
    pub fn with_rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let mut table = Self::new(columns);
        table.set_data(rows);
        table
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Replace the whole record set.
    pub fn set_data(&mut self, rows: Vec<Vec<Value>>) {
        self.records.clear();

        for row in rows {
            let mut record = Record::from_row(&self.columns, row);
            record.set_bound(true);
            self.records.push(record);
        }
    }

    /// Current sort order, if any.
    pub fn sorting(&self) -> Option<&str> {
        self.order.as_deref()
    }

    pub fn set_sorting(&mut self, order: &str) {
        self.sorting = SortOrder::parse(order);
        self.order = Some(order.to_string());
    }

    pub fn add_columns(&mut self, columns: &[&str]) {
        for column in columns {
            let column = column.to_lowercase();
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }
    }

    pub fn remove_columns(&mut self, columns: &[&str]) {
        let remove: Vec<String> = columns.iter().map(|c| c.to_lowercase()).collect();
        self.columns.retain(|c| !remove.contains(c));
    }

    /// AND a filter into the static limit applied to every query.
    pub fn add_filter(&mut self, filter: Filter) -> &mut Self {
        self.limit.and(filter);
        self
    }

    /// Copy of this table, optionally projected onto other columns.
    pub fn clone_with(&self, columns: Option<&[&str]>) -> MemoryTable {
        let columns: Vec<String> = match columns {
            Some(columns) => columns.iter().map(|c| c.to_lowercase()).collect(),
            None => self.columns.clone(),
        };

        let rows: Vec<Vec<Value>> = self
            .records
            .iter()
            .map(|rec| columns.iter().map(|c| rec.value(c)).collect())
            .collect();

        let column_refs: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
        let mut clone = MemoryTable::with_rows(&column_refs, rows);

        clone.name = self.name.clone();
        if let Some(order) = &self.order {
            clone.set_sorting(order);
        }

        clone
    }

    /// Drop staged mutations without applying or reverting them.
    pub fn clear(&mut self) {
        self.staged.clear();
    }

    pub fn row_count(&self) -> usize {
        self.records.len()
    }

    /// Idempotent staging: re-staging a record refreshes the staged copy
    /// instead of duplicating it.
    fn stage(&mut self, record: &Record) {
        match self.staged.iter().position(|r| r.id() == record.id()) {
            Some(idx) => self.staged[idx] = record.clone(),
            None => self.staged.push(record.clone()),
        }
    }

    fn sort(&mut self) {
        if self.sorting.is_empty() {
            return;
        }

        let keys = self.sorting.clone();
        self.records.sort_by(|r1, r2| {
            for key in &keys {
                let ord = r1.value(&key.column).compare(&r2.value(&key.column));
                let ord = if key.ascending { ord } else { ord.reverse() };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
}

#[async_trait]
impl DataSource for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn row_locking(&self) -> LockMode {
        LockMode::None
    }

    async fn query(&mut self, filter: FilterStructure) -> anyhow::Result<bool> {
        self.pos = 0;
        self.filter = filter;
        self.filter
            .and_structure(sections::LIMIT, self.limit.clone());

        self.sort();
        Ok(true)
    }

    async fn fetch(&mut self) -> anyhow::Result<Vec<Record>> {
        while self.pos < self.records.len() {
            let record = &self.records[self.pos];
            self.pos += 1;

            if self.filter.is_empty() || self.filter.evaluate(record) {
                return Ok(vec![record.clone()]);
            }
        }

        Ok(vec![])
    }

    async fn insert(&mut self, record: &Record) -> anyhow::Result<bool> {
        self.stage(record);
        Ok(true)
    }

    async fn update(&mut self, record: &Record) -> anyhow::Result<bool> {
        self.stage(record);
        Ok(true)
    }

    async fn delete(&mut self, record: &Record) -> anyhow::Result<bool> {
        self.stage(record);
        Ok(true)
    }

    async fn flush(&mut self) -> anyhow::Result<Vec<Record>> {
        let mut processed = Vec::new();

        for mut staged in self.staged.drain(..) {
            match staged.state() {
                RecordState::Inserted => {
                    staged.set_bound(true);

                    let mut stored = staged.clone();
                    stored.mark_consistent();
                    self.records.push(stored);

                    processed.push(staged);
                }
                RecordState::Updated => {
                    if let Some(idx) = self.records.iter().position(|r| r.id() == staged.id()) {
                        let mut stored = staged.clone();
                        stored.mark_consistent();
                        self.records[idx] = stored;
                    }
                    processed.push(staged);
                }
                RecordState::Deleted => {
                    staged.set_bound(false);

                    if let Some(idx) = self.records.iter().position(|r| r.id() == staged.id()) {
                        if idx < self.pos {
                            self.pos -= 1;
                        }
                        self.records.remove(idx);
                    }

                    processed.push(staged);
                }
                _ => {}
            }
        }

        Ok(processed)
    }

    async fn undo(&mut self) -> anyhow::Result<Vec<Record>> {
        let mut undone = Vec::new();

        for mut staged in self.staged.drain(..) {
            staged.refresh();

            match staged.state() {
                RecordState::New | RecordState::Inserted => {
                    // Never flushed, so there is nothing in the store to
                    // revert; the record is discarded entirely.
                    staged.set_state(RecordState::Deleted);
                    staged.set_bound(false);
                }
                RecordState::Updated | RecordState::Deleted => {
                    staged.set_state(RecordState::Consistent);
                }
                _ => {}
            }

            undone.push(staged);
        }

        Ok(undone)
    }

    async fn lock(&mut self, _record: &Record) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn refresh(&self, record: &mut Record) -> anyhow::Result<bool> {
        record.refresh();
        Ok(true)
    }

    async fn close_cursor(&mut self) -> anyhow::Result<bool> {
        Ok(true)
    }
}
