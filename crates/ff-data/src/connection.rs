//! Boundary to the (external) connection/transport layer
//!
//! The core issues structured statements and reads plain response structs;
//! how the statement text becomes SQL over the wire is the connection
//! implementation's concern.

use async_trait::async_trait;
use ff_core::{FilterStructure, Transactional, Value};

/// Column datatype as reported by a describe probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int,
    Number,
    Text,
    Bool,
    Date,
    DateTime,
    Timestamp,
}

impl DataType {
    /// Parse a backend type name, case-insensitive.
    pub fn parse(name: &str) -> Option<DataType> {
        match name.to_lowercase().as_str() {
            "int" | "integer" | "smallint" | "bigint" => Some(DataType::Int),
            "number" | "numeric" | "float" | "double" | "decimal" => Some(DataType::Number),
            "text" | "varchar" | "varchar2" | "char" | "string" => Some(DataType::Text),
            "bool" | "boolean" => Some(DataType::Bool),
            "date" => Some(DataType::Date),
            "datetime" => Some(DataType::DateTime),
            "timestamp" => Some(DataType::Timestamp),
            _ => None,
        }
    }

    /// Whether values of this type arrive as epoch milliseconds.
    pub fn is_date(&self) -> bool {
        matches!(self, DataType::Date | DataType::DateTime | DataType::Timestamp)
    }
}

/// A value bound into a statement, typed once the source has been described.
#[derive(Debug, Clone)]
pub struct BindValue {
    pub column: String,
    pub value: Value,
    pub datatype: Option<DataType>,
}

/// A structured statement handed to the connection layer. The filter tree
/// and sort order travel as data; rendering them is not this crate's job.
#[derive(Debug, Clone)]
pub struct Statement {
    pub text: String,
    pub order_by: Option<String>,
    pub filter: Option<FilterStructure>,
    pub bindings: Vec<BindValue>,
}

impl Statement {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            order_by: None,
            filter: None,
            bindings: Vec::new(),
        }
    }
}

/// Handle for an open backend cursor.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub name: String,
    pub eof: bool,
}

impl Cursor {
    pub fn new(name: String) -> Self {
        Self { name, eof: false }
    }
}

/// Response to a select or describe.
#[derive(Debug, Clone, Default)]
pub struct SelectResponse {
    pub success: bool,
    pub message: Option<String>,
    pub columns: Vec<String>,
    pub types: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// More rows remain behind the cursor.
    pub more: bool,
}

/// Response to a cursor fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub success: bool,
    pub message: Option<String>,
    pub rows: Vec<Vec<Value>>,
    pub more: bool,
}

/// Capability interface over one backend connection.
#[async_trait]
pub trait Connection: Transactional {
    /// Execute a statement. With `describe_only` the backend returns the
    /// column/type shape without producing rows.
    async fn select(
        &self,
        statement: &Statement,
        cursor: Option<&Cursor>,
        fetch_size: usize,
        describe_only: bool,
    ) -> SelectResponse;

    /// Fetch the next page of an open cursor.
    async fn fetch(&self, cursor: &Cursor) -> FetchResponse;

    /// Close an open cursor.
    async fn close(&self, cursor: &Cursor) -> bool;
}
