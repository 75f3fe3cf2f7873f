//! Record lifecycle and field storage

use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique record identity. Stable across `refresh()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec#{}", self.0)
    }
}

/// Lifecycle state of a record.
///
/// `QueryFilter` marks the staging record that collects query-by-example
/// criteria while a block is in query mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    New,
    Inserted,
    Updated,
    Deleted,
    Consistent,
    QueryFilter,
}

/// A single row of data.
///
/// Column keys are case-insensitive and normalized to lowercase. Each record
/// keeps a snapshot of its last consistent values so `refresh()` and undo can
/// restore them. The owning block is tracked by name only; ownership always
/// runs Form -> Block -> Record, never backwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    state: RecordState,
    bound: bool,
    block: Option<String>,
    values: IndexMap<String, Value>,
    snapshot: IndexMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self {
            id: RecordId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            state: RecordState::New,
            bound: false,
            block: None,
            values: IndexMap::new(),
            snapshot: IndexMap::new(),
        }
    }

    /// Build a record from parallel column/value slices, as fetched from a
    /// datasource. The snapshot is taken immediately.
    pub fn from_row(columns: &[String], row: Vec<Value>) -> Self {
        let mut record = Record::new();

        for (column, value) in columns.iter().zip(row) {
            record.values.insert(column.to_lowercase(), value);
        }

        record.state = RecordState::Consistent;
        record.snapshot = record.values.clone();
        record
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn set_state(&mut self, state: RecordState) {
        self.state = state;
    }

    pub fn bound(&self) -> bool {
        self.bound
    }

    pub fn set_bound(&mut self, bound: bool) {
        self.bound = bound;
    }

    /// Name of the owning block, if the record has been adopted by one.
    pub fn block(&self) -> Option<&str> {
        self.block.as_deref()
    }

    pub fn set_block(&mut self, block: &str) {
        self.block = Some(block.to_string());
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(&column.to_lowercase())
    }

    /// Value of `column`, `Null` when absent.
    pub fn value(&self, column: &str) -> Value {
        self.get(column).cloned().unwrap_or(Value::Null)
    }

    /// Set a field. A bound, consistent record transitions to `Updated`.
    /// Returns true when the record now holds a pending change the owning
    /// block should track.
    pub fn set_value(&mut self, column: &str, value: impl Into<Value>) -> bool {
        let column = column.to_lowercase();
        let value = value.into();

        let unchanged = self.values.get(&column) == Some(&value);
        self.values.insert(column, value);

        if unchanged {
            return false;
        }

        match self.state {
            RecordState::Consistent if self.bound => {
                self.state = RecordState::Updated;
                true
            }
            RecordState::New | RecordState::Inserted | RecordState::Updated => true,
            _ => false,
        }
    }

    /// Drop all field values, keeping identity and state.
    pub fn clear_values(&mut self) {
        for value in self.values.values_mut() {
            *value = Value::Null;
        }
    }

    /// True when any field carries a non-null value.
    pub fn has_values(&self) -> bool {
        self.values.values().any(|v| !v.is_null())
    }

    /// Restore the last consistent snapshot. Identity is preserved.
    pub fn refresh(&mut self) {
        self.values = self.snapshot.clone();
    }

    /// Accept the current values as the consistent baseline.
    pub fn mark_consistent(&mut self) {
        self.state = RecordState::Consistent;
        self.snapshot = self.values.clone();
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let mut rec = Record::new();
        rec.set_value("CustId", 7);
        assert_eq!(rec.value("custid"), Value::Int(7));
        assert_eq!(rec.value("CUSTID"), Value::Int(7));
    }

    #[test]
    fn bound_consistent_record_becomes_updated_on_edit() {
        let mut rec = Record::from_row(&["name".to_string()], vec!["a".into()]);
        rec.set_bound(true);

        assert!(!rec.set_value("name", "a"));
        assert_eq!(rec.state(), RecordState::Consistent);

        assert!(rec.set_value("name", "b"));
        assert_eq!(rec.state(), RecordState::Updated);
    }

    #[test]
    fn records_serialize_with_their_field_maps() {
        let rec = Record::from_row(
            &["custid".to_string(), "name".to_string()],
            vec![7.into(), "ham".into()],
        );

        let json = serde_json::to_string(&rec).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();

        assert_eq!(back.value("custid"), Value::Int(7));
        assert_eq!(back.value("name"), Value::Text("ham".into()));
        assert_eq!(back.state(), RecordState::Consistent);
    }

    #[test]
    fn refresh_restores_snapshot_and_keeps_id() {
        let mut rec = Record::from_row(&["name".to_string()], vec!["a".into()]);
        let id = rec.id();

        rec.set_value("name", "b");
        rec.refresh();

        assert_eq!(rec.id(), id);
        assert_eq!(rec.value("name"), Value::Text("a".into()));
    }
}
