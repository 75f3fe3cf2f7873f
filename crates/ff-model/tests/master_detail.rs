//! End-to-end tests of query cascades over linked blocks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ff_core::{DataSource, FilterStructure, NullView, Record, Transactional, Value};
use ff_data::MemoryTable;
use ff_model::{Form, Link};
use tokio::sync::Notify;

fn customers() -> MemoryTable {
    let mut table = MemoryTable::with_rows(
        &["custid", "name"],
        vec![
            vec![Value::Int(7), Value::Text("Hammond".into())],
            vec![Value::Int(3), Value::Text("Adams".into())],
            vec![Value::Int(9), Value::Text("Baker".into())],
        ],
    );
    table.set_name("customers");
    table
}

fn orders() -> MemoryTable {
    let mut table = MemoryTable::with_rows(
        &["ordid", "custid", "amount"],
        vec![
            vec![Value::Int(1), Value::Int(7), Value::Int(100)],
            vec![Value::Int(2), Value::Int(7), Value::Int(250)],
            vec![Value::Int(3), Value::Int(3), Value::Int(40)],
            vec![Value::Int(4), Value::Int(9), Value::Int(75)],
        ],
    );
    table.set_name("orders");
    table
}

fn order_ids(form: &Form) -> Vec<Value> {
    form.block("orders")
        .unwrap()
        .records()
        .iter()
        .map(|r| r.value("ordid"))
        .collect()
}

/// Delegating source that counts how many queries reach it.
struct CountingSource {
    inner: MemoryTable,
    queries: Arc<AtomicUsize>,
}

#[async_trait]
impl DataSource for CountingSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn columns(&self) -> Vec<String> {
        self.inner.columns()
    }

    async fn query(&mut self, filter: FilterStructure) -> anyhow::Result<bool> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query(filter).await
    }

    async fn fetch(&mut self) -> anyhow::Result<Vec<Record>> {
        self.inner.fetch().await
    }

    async fn insert(&mut self, record: &Record) -> anyhow::Result<bool> {
        self.inner.insert(record).await
    }

    async fn update(&mut self, record: &Record) -> anyhow::Result<bool> {
        self.inner.update(record).await
    }

    async fn delete(&mut self, record: &Record) -> anyhow::Result<bool> {
        self.inner.delete(record).await
    }

    async fn flush(&mut self) -> anyhow::Result<Vec<Record>> {
        self.inner.flush().await
    }

    async fn undo(&mut self) -> anyhow::Result<Vec<Record>> {
        self.inner.undo().await
    }

    async fn lock(&mut self, record: &Record) -> anyhow::Result<bool> {
        self.inner.lock(record).await
    }

    async fn refresh(&self, record: &mut Record) -> anyhow::Result<bool> {
        self.inner.refresh(record).await
    }

    async fn close_cursor(&mut self) -> anyhow::Result<bool> {
        self.inner.close_cursor().await
    }
}

/// Source whose fetch blocks until the test opens the gate, so a query can
/// be held in flight while the test issues a newer one.
struct GatedSource {
    columns: Vec<String>,
    rows: Vec<Record>,
    gate: Arc<Notify>,
    fetched: bool,
}

impl GatedSource {
    fn new(gate: Arc<Notify>) -> Self {
        let columns = vec!["id".to_string()];
        let rows = vec![
            Record::from_row(&columns, vec![Value::Int(1)]),
            Record::from_row(&columns, vec![Value::Int(2)]),
        ];
        Self {
            columns,
            rows,
            gate,
            fetched: false,
        }
    }
}

#[async_trait]
impl DataSource for GatedSource {
    fn name(&self) -> &str {
        "gated"
    }

    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    async fn query(&mut self, _filter: FilterStructure) -> anyhow::Result<bool> {
        self.fetched = false;
        Ok(true)
    }

    async fn fetch(&mut self) -> anyhow::Result<Vec<Record>> {
        if self.fetched {
            return Ok(vec![]);
        }
        self.gate.notified().await;
        self.fetched = true;
        Ok(self.rows.clone())
    }

    async fn insert(&mut self, _record: &Record) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn update(&mut self, _record: &Record) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn delete(&mut self, _record: &Record) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn flush(&mut self) -> anyhow::Result<Vec<Record>> {
        Ok(vec![])
    }

    async fn undo(&mut self) -> anyhow::Result<Vec<Record>> {
        Ok(vec![])
    }

    async fn lock(&mut self, _record: &Record) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn refresh(&self, _record: &mut Record) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn close_cursor(&mut self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

struct CommitSpy {
    commits: AtomicUsize,
}

#[async_trait]
impl Transactional for CommitSpy {
    async fn commit(&self) -> bool {
        self.commits.fetch_add(1, Ordering::SeqCst);
        true
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn linked_form() -> Form {
    init_tracing();
    let form = Form::new("demo", Box::new(NullView));
    form.add_block("customers", Box::new(customers()));
    form.add_block("orders", Box::new(orders()));
    form.link(Link::new(
        "customers",
        "orders",
        &["custid"],
        &["custid"],
        false,
    ))
    .unwrap();
    form
}

#[tokio::test]
async fn query_cascades_from_master_into_details() {
    let form = linked_form();

    assert!(form.execute_query("customers", false).await.unwrap());

    let master = form.block("customers").unwrap();
    assert_eq!(master.record_count(), 3);
    assert_eq!(master.current_row(), Some(0));
    assert_eq!(master.get_value("custid"), Value::Int(7));

    // Detail is constrained to the master's current row
    assert_eq!(order_ids(&form), vec![Value::Int(1), Value::Int(2)]);
}

#[tokio::test]
async fn selecting_a_master_row_requeries_details() {
    let form = linked_form();
    form.execute_query("customers", false).await.unwrap();

    assert!(form.select_row("customers", 1).await.unwrap());

    assert_eq!(
        form.block("customers").unwrap().get_value("custid"),
        Value::Int(3)
    );
    assert_eq!(order_ids(&form), vec![Value::Int(3)]);

    // Out-of-range rows are refused and nothing changes
    assert!(!form.select_row("customers", 10).await.unwrap());
    assert_eq!(order_ids(&form), vec![Value::Int(3)]);
}

#[tokio::test]
async fn strict_detail_is_cleared_when_master_comes_up_empty() {
    let form = Form::new("demo", Box::new(NullView));
    let mut empty = MemoryTable::new(&["custid", "name"]);
    empty.set_name("customers");
    form.add_block("customers", Box::new(empty));
    form.add_block("orders", Box::new(orders()));
    form.link(Link::new(
        "customers",
        "orders",
        &["custid"],
        &["custid"],
        false,
    ))
    .unwrap();

    // Populate the detail outside the cascade first
    let chain = form.query_manager().start_new_chain();
    let detail = form.block("orders").unwrap();
    detail.execute_query(chain).await.unwrap();
    assert_eq!(detail.record_count(), 4);

    // The cascade still succeeds; the master-less strict detail is
    // excluded and its stale rows are dropped
    assert!(form.execute_query("customers", false).await.unwrap());
    assert_eq!(form.block("customers").unwrap().record_count(), 0);
    assert_eq!(detail.record_count(), 0);
}

#[tokio::test]
async fn stale_results_never_touch_the_buffer() {
    let gate = Arc::new(Notify::new());
    let form = Form::new("demo", Box::new(NullView));
    let block = form.add_block("gated", Box::new(GatedSource::new(gate.clone())));

    let chain = form.query_manager().start_new_chain();
    let running = block.clone();
    let handle = tokio::spawn(async move { running.execute_query(chain).await });

    // Supersede the in-flight query, then let its fetch complete
    form.query_manager().start_new_chain();
    gate.notify_one();

    assert!(!handle.await.unwrap().unwrap());
    assert_eq!(block.record_count(), 0);

    // The current chain applies normally
    let chain = form.query_manager().start_new_chain();
    gate.notify_one();
    assert!(block.execute_query(chain).await.unwrap());
    assert_eq!(block.record_count(), 2);
}

#[tokio::test]
async fn undo_requeries_only_top_level_dirty_blocks() {
    let master_queries = Arc::new(AtomicUsize::new(0));

    let form = Form::new("demo", Box::new(NullView));
    form.add_block(
        "customers",
        Box::new(CountingSource {
            inner: customers(),
            queries: master_queries.clone(),
        }),
    );
    form.add_block("orders", Box::new(orders()));
    form.link(Link::new(
        "customers",
        "orders",
        &["custid"],
        &["custid"],
        false,
    ))
    .unwrap();

    form.execute_query("customers", false).await.unwrap();
    assert_eq!(master_queries.load(Ordering::SeqCst), 1);

    let detail = form.block("orders").unwrap();
    assert!(detail.set_value("amount", 999).await.unwrap());
    assert!(detail.is_dirty());
    assert_eq!(form.dirty_count(), 1);

    assert!(form.undo().await.unwrap());

    // The edit is reverted and only the dirty subtree was requeried
    assert_eq!(detail.get_value("amount"), Value::Int(100));
    assert_eq!(form.dirty_count(), 0);
    assert_eq!(master_queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn query_by_example_filters_the_cascade() {
    let form = linked_form();
    form.execute_query("customers", false).await.unwrap();

    assert!(form.enter_query("customers").await.unwrap());
    let master = form.block("customers").unwrap();
    assert!(master.querymode());

    // Criteria land on the query-by-example record, not the buffer
    master.set_value("name", "Ba%").await.unwrap();
    assert_eq!(master.get_value("name"), Value::Text("Ba%".into()));

    assert!(form.execute_query("customers", false).await.unwrap());
    assert!(!master.querymode());

    assert_eq!(master.record_count(), 1);
    assert_eq!(master.get_value("name"), Value::Text("Baker".into()));
    assert_eq!(order_ids(&form), vec![Value::Int(4)]);
}

#[tokio::test]
async fn cancel_query_mode_restores_the_block() {
    let form = linked_form();
    form.execute_query("customers", false).await.unwrap();

    form.enter_query("customers").await.unwrap();
    form.cancel_query_mode("customers");

    let master = form.block("customers").unwrap();
    assert!(!master.querymode());
    assert_eq!(master.get_value("name"), Value::Text("Hammond".into()));
}

#[tokio::test]
async fn executing_from_a_detail_in_query_mode_starts_at_the_query_master() {
    let form = Form::new("demo", Box::new(NullView));
    form.add_block("customers", Box::new(customers()));
    form.add_block("orders", Box::new(orders()));
    form.link(Link::new(
        "customers",
        "orders",
        &["custid"],
        &["custid"],
        true,
    ))
    .unwrap();

    form.execute_query("customers", false).await.unwrap();
    assert!(form.enter_query("orders").await.unwrap());

    // Executing from the detail resolves to its query master, so the
    // whole cascade runs from the top
    assert!(form.execute_query("orders", false).await.unwrap());
    assert_eq!(form.block("customers").unwrap().record_count(), 3);
    assert_eq!(form.query_manager().query_master(), Some("customers".into()));
}

#[tokio::test]
async fn field_change_requeries_only_details_joined_on_it() {
    let order_queries = Arc::new(AtomicUsize::new(0));
    let note_queries = Arc::new(AtomicUsize::new(0));

    let mut notes = MemoryTable::with_rows(
        &["custname", "text"],
        vec![vec![Value::Text("Hammond".into()), Value::Text("vip".into())]],
    );
    notes.set_name("notes");

    let form = Form::new("demo", Box::new(NullView));
    form.add_block("customers", Box::new(customers()));
    form.add_block(
        "orders",
        Box::new(CountingSource {
            inner: orders(),
            queries: order_queries.clone(),
        }),
    );
    form.add_block(
        "notes",
        Box::new(CountingSource {
            inner: notes,
            queries: note_queries.clone(),
        }),
    );
    form.link(Link::new(
        "customers",
        "orders",
        &["custid"],
        &["custid"],
        false,
    ))
    .unwrap();
    form.link(Link::new(
        "customers",
        "notes",
        &["name"],
        &["custname"],
        false,
    ))
    .unwrap();

    form.execute_query("customers", false).await.unwrap();
    assert_eq!(order_queries.load(Ordering::SeqCst), 1);
    assert_eq!(note_queries.load(Ordering::SeqCst), 1);

    assert!(form
        .query_field_details("customers", "custid")
        .await
        .unwrap());

    assert_eq!(order_queries.load(Ordering::SeqCst), 2);
    assert_eq!(note_queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn insert_flush_makes_the_row_queryable() {
    let form = linked_form();
    form.execute_query("customers", false).await.unwrap();

    let master = form.block("customers").unwrap();
    assert!(master.insert(true).await.unwrap());
    master.set_value("custid", 11).await.unwrap();
    master.set_value("name", "Nash").await.unwrap();
    assert!(master.is_dirty());

    assert!(form.flush().await.unwrap());
    assert!(!master.is_dirty());

    form.execute_query("customers", false).await.unwrap();
    assert_eq!(master.record_count(), 4);
}

#[tokio::test]
async fn save_commits_registered_transactions() {
    let form = linked_form();
    let spy = Arc::new(CommitSpy {
        commits: AtomicUsize::new(0),
    });
    form.register_transaction(spy.clone());

    assert!(form.save().await.unwrap());
    assert_eq!(spy.commits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn control_blocks_never_enter_query_mode() {
    let form = Form::new("demo", Box::new(NullView));
    let mut lov = MemoryTable::with_rows(
        &["code", "label"],
        vec![vec![Value::Text("A".into()), Value::Text("Active".into())]],
    );
    lov.set_name("status");
    let block = form.add_control_block("status", Box::new(lov));

    form.init_control_blocks().await.unwrap();
    assert_eq!(block.record_count(), 1);

    assert!(!form.enter_query("status").await.unwrap());
    assert!(!form.execute_query("status", false).await.unwrap());
}
