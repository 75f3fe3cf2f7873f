//! Cursor-backed datasource over a remote backing store

use crate::connection::{BindValue, Connection, Cursor, DataType, Statement};
use ahash::AHashMap;
use async_trait::async_trait;
use chrono::DateTime;
use ff_core::filter::sections;
use ff_core::{alerts, DataError, DataSource, Filter, FilterStructure, LockMode, Record, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

static CURSOR_SEQ: AtomicU64 = AtomicU64::new(1);

/// Read-only datasource backed by a statement executed on a remote
/// connection.
///
/// The column/datatype shape is cached from a one-time describe probe (a
/// zero-row execution of the same statement) and refreshed only when the
/// statement text changes. Sub-query predicates in the `details` section
/// cannot travel through the opaque statement, so they are split off into a
/// residual filter evaluated per fetched row before the row is surfaced.
pub struct QueryTable {
    name: String,
    conn: Arc<dyn Connection>,
    statement: String,
    order: Option<String>,
    fetch_size: usize,
    described: bool,
    columns: Vec<String>,
    datatypes: AHashMap<String, DataType>,
    pinned: AHashMap<String, DataType>,
    cursor: Option<Cursor>,
    fetched: Vec<Record>,
    nosql: Option<FilterStructure>,
    limit: FilterStructure,
}

impl QueryTable {
    pub fn new(conn: Arc<dyn Connection>, statement: &str) -> Self {
        Self {
            name: "query".to_string(),
            conn,
            statement: statement.to_string(),
            order: None,
            fetch_size: 32,
            described: false,
            columns: Vec::new(),
            datatypes: AHashMap::new(),
            pinned: AHashMap::new(),
            cursor: None,
            fetched: Vec::new(),
            nosql: None,
            limit: FilterStructure::new(),
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Replace the statement text. Forces a re-describe on the next query.
    pub fn set_statement(&mut self, statement: &str) {
        self.statement = statement.to_string();
        self.described = false;
    }

    pub fn set_sorting(&mut self, order: &str) {
        self.order = Some(order.to_string());
    }

    pub fn set_fetch_size(&mut self, size: usize) {
        self.fetch_size = size.max(1);
    }

    /// Pin a column's datatype, overriding whatever describe reports, now
    /// and on every future re-describe.
    pub fn set_datatype(&mut self, column: &str, datatype: DataType) -> &mut Self {
        let column = column.to_lowercase();
        self.pinned.insert(column.clone(), datatype);
        self.datatypes.insert(column, datatype);
        self
    }

    /// AND a filter into the static limit applied to every query.
    pub fn add_filter(&mut self, filter: Filter) -> &mut Self {
        self.limit.and(filter);
        self
    }

    /// Copy sharing the connection, schema cache and settings.
    pub fn clone_table(&self) -> QueryTable {
        QueryTable {
            name: self.name.clone(),
            conn: Arc::clone(&self.conn),
            statement: self.statement.clone(),
            order: self.order.clone(),
            fetch_size: self.fetch_size,
            described: self.described,
            columns: self.columns.clone(),
            datatypes: self.datatypes.clone(),
            pinned: self.pinned.clone(),
            cursor: None,
            fetched: Vec::new(),
            nosql: None,
            limit: self.limit.clone(),
        }
    }

    async fn describe(&mut self) -> bool {
        if self.described {
            return true;
        }

        let probe = Statement::new(&self.statement);
        let response = self.conn.select(&probe, None, 1, true).await;

        if !response.success {
            alerts::warning(
                &format!("Unable to describe query '{}'", self.statement),
                "Database",
            );
            return false;
        }

        for (i, column) in response.columns.iter().enumerate() {
            let cname = column.to_lowercase();

            // Pinned types win over described ones; everything else is
            // refreshed so a changed statement cannot leave stale types
            if self.pinned.contains_key(&cname) {
                continue;
            }

            if let Some(datatype) = response.types.get(i).and_then(|t| DataType::parse(t)) {
                self.datatypes.insert(cname, datatype);
            }
        }

        self.columns = response.columns.iter().map(|c| c.to_lowercase()).collect();
        self.described = true;
        true
    }

    fn typed_bindings(&self, filter: &FilterStructure) -> Vec<BindValue> {
        let mut bindings = Vec::new();

        for section in [sections::QBE, sections::LIMIT, sections::MASTERS] {
            for (column, value) in filter.bind_values(section) {
                let datatype = self.datatypes.get(&column).copied();
                bindings.push(BindValue {
                    column,
                    value,
                    datatype,
                });
            }
        }

        bindings
    }

    fn parse_rows(&self, rows: Vec<Vec<Value>>) -> Vec<Record> {
        let dates: Vec<bool> = self
            .columns
            .iter()
            .map(|c| self.datatypes.get(c).map(|t| t.is_date()).unwrap_or(false))
            .collect();

        rows.into_iter()
            .map(|mut row| {
                for (c, value) in row.iter_mut().enumerate() {
                    // Date columns arrive as epoch milliseconds
                    if dates.get(c).copied().unwrap_or(false) {
                        if let Value::Int(ms) = value {
                            if let Some(dt) = DateTime::from_timestamp_millis(*ms) {
                                *value = Value::Date(dt.naive_utc());
                            }
                        }
                    }
                }
                Record::from_row(&self.columns, row)
            })
            .collect()
    }

    /// Residual pass for predicates the backend cannot express.
    fn residual(&self, records: Vec<Record>) -> Vec<Record> {
        match &self.nosql {
            Some(nosql) => records.into_iter().filter(|r| nosql.evaluate(r)).collect(),
            None => records,
        }
    }

    async fn discard_cursor(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            if !cursor.eof {
                self.conn.close(&cursor).await;
            }
        }
    }
}

#[async_trait]
impl DataSource for QueryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn insert_allowed(&self) -> bool {
        false
    }

    fn update_allowed(&self) -> bool {
        false
    }

    fn delete_allowed(&self) -> bool {
        false
    }

    fn row_locking(&self) -> LockMode {
        LockMode::None
    }

    async fn query(&mut self, filter: FilterStructure) -> anyhow::Result<bool> {
        self.fetched.clear();
        self.nosql = None;

        if !self.conn.connected() {
            alerts::warning("Not connected", "Database Connection");
            return Ok(false);
        }

        if !self.describe().await {
            return Ok(false);
        }

        let mut filter = filter;
        filter.and_structure(sections::LIMIT, self.limit.clone());

        let residual = filter.drain_subqueries();
        if !residual.is_empty() {
            let mut nosql = FilterStructure::named(&format!("{}.nosql", self.name));
            for leaf in residual {
                nosql.and(leaf);
            }
            debug!(source = %self.name, leaves = nosql.leaves().len(), "residual filter active");
            self.nosql = Some(nosql);
        }

        self.discard_cursor().await;
        self.cursor = Some(Cursor::new(format!(
            "select{}",
            CURSOR_SEQ.fetch_add(1, Ordering::Relaxed)
        )));

        let statement = Statement {
            text: self.statement.clone(),
            order_by: self.order.clone(),
            bindings: self.typed_bindings(&filter),
            filter: Some(filter),
        };

        let response = self
            .conn
            .select(&statement, self.cursor.as_ref(), self.fetch_size, false)
            .await;

        if !response.success {
            self.cursor = None;
            error!(source = %self.name, message = ?response.message, "query failed");
            return Ok(false);
        }

        if let Some(cursor) = self.cursor.as_mut() {
            cursor.eof = !response.more;
        }

        let records = self.parse_rows(response.rows);
        self.fetched = self.residual(records);

        Ok(true)
    }

    async fn fetch(&mut self) -> anyhow::Result<Vec<Record>> {
        if !self.fetched.is_empty() {
            return Ok(std::mem::take(&mut self.fetched));
        }

        loop {
            let cursor = match &self.cursor {
                Some(cursor) if !cursor.eof => cursor.clone(),
                _ => return Ok(vec![]),
            };

            let response = self.conn.fetch(&cursor).await;

            if !response.success {
                error!(source = %self.name, message = ?response.message, "fetch failed");
                return Ok(vec![]);
            }

            if let Some(cursor) = self.cursor.as_mut() {
                cursor.eof = !response.more;
            }

            let batch = self.residual(self.parse_rows(response.rows));

            // The residual pass may eat a whole page; keep fetching so the
            // caller only ever sees exhaustion at true end-of-cursor.
            if !batch.is_empty() {
                return Ok(batch);
            }

            if !response.more {
                return Ok(vec![]);
            }
        }
    }

    async fn insert(&mut self, _record: &Record) -> anyhow::Result<bool> {
        alerts::fatal(
            "Cannot insert records into a datasource based on a query",
            "Datasource",
        );
        Err(DataError::ReadOnly {
            op: "insert",
            datasource: self.name.clone(),
        }
        .into())
    }

    async fn update(&mut self, _record: &Record) -> anyhow::Result<bool> {
        alerts::fatal(
            "Cannot update records on a datasource based on a query",
            "Datasource",
        );
        Err(DataError::ReadOnly {
            op: "update",
            datasource: self.name.clone(),
        }
        .into())
    }

    async fn delete(&mut self, _record: &Record) -> anyhow::Result<bool> {
        alerts::fatal(
            "Cannot delete records on a datasource based on a query",
            "Datasource",
        );
        Err(DataError::ReadOnly {
            op: "delete",
            datasource: self.name.clone(),
        }
        .into())
    }

    async fn flush(&mut self) -> anyhow::Result<Vec<Record>> {
        Ok(vec![])
    }

    async fn undo(&mut self) -> anyhow::Result<Vec<Record>> {
        Ok(vec![])
    }

    async fn lock(&mut self, _record: &Record) -> anyhow::Result<bool> {
        alerts::fatal(
            "Cannot lock records on datasource based on a query",
            "Datasource",
        );
        Err(DataError::LockingNotSupported {
            datasource: self.name.clone(),
        }
        .into())
    }

    async fn refresh(&self, record: &mut Record) -> anyhow::Result<bool> {
        record.refresh();
        Ok(true)
    }

    async fn close_cursor(&mut self) -> anyhow::Result<bool> {
        self.discard_cursor().await;
        self.fetched.clear();
        Ok(true)
    }
}
