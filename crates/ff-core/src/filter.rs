//! Composable boolean predicate trees
//!
//! A [`FilterStructure`] is a tree of named sections, each holding leaf
//! filters or nested structures, combined by logical AND. The orchestration
//! layer inspects sections by name, so the section names below are part of
//! the contract between blocks, coordinators and datasources.

use crate::record::Record;
use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Well-known filter sections.
pub mod sections {
    /// Query-by-example criteria entered by the user.
    pub const QBE: &str = "qbe";
    /// Static limit imposed by the datasource itself.
    pub const LIMIT: &str = "limit";
    /// Join constraints from master blocks onto a detail.
    pub const MASTERS: &str = "masters";
    /// Dependency constraints from detail blocks onto a master.
    pub const DETAILS: &str = "details";
}

/// A leaf predicate over a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Equals {
        column: String,
        value: Value,
    },
    NotEquals {
        column: String,
        value: Value,
    },
    GreaterThan {
        column: String,
        value: Value,
        or_equal: bool,
    },
    LessThan {
        column: String,
        value: Value,
        or_equal: bool,
    },
    Between {
        column: String,
        lower: Value,
        upper: Value,
    },
    Like {
        column: String,
        pattern: String,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    IsNull {
        column: String,
    },
    /// Membership of a column tuple in a row set. `rows: None` means the
    /// set is not resolvable client-side; only a backend can evaluate it,
    /// and cursor-backed sources route such leaves to their residual pass.
    SubQuery {
        columns: Vec<String>,
        rows: Option<Vec<Vec<Value>>>,
    },
}

impl Filter {
    pub fn equals(column: &str, value: impl Into<Value>) -> Self {
        Filter::Equals {
            column: column.to_lowercase(),
            value: value.into(),
        }
    }

    pub fn like(column: &str, pattern: &str) -> Self {
        Filter::Like {
            column: column.to_lowercase(),
            pattern: pattern.to_string(),
        }
    }

    /// Evaluate against a record. Unresolved sub-queries do not constrain
    /// here; the datasource that owns them is responsible for them.
    pub fn evaluate(&self, record: &Record) -> bool {
        use std::cmp::Ordering;

        match self {
            Filter::Equals { column, value } => record.value(column).compare(value) == Ordering::Equal,
            Filter::NotEquals { column, value } => {
                record.value(column).compare(value) != Ordering::Equal
            }
            Filter::GreaterThan {
                column,
                value,
                or_equal,
            } => match record.value(column).compare(value) {
                Ordering::Greater => true,
                Ordering::Equal => *or_equal,
                Ordering::Less => false,
            },
            Filter::LessThan {
                column,
                value,
                or_equal,
            } => match record.value(column).compare(value) {
                Ordering::Less => true,
                Ordering::Equal => *or_equal,
                Ordering::Greater => false,
            },
            Filter::Between {
                column,
                lower,
                upper,
            } => {
                let value = record.value(column);
                value.compare(lower) != Ordering::Less && value.compare(upper) != Ordering::Greater
            }
            Filter::Like { column, pattern } => record.value(column).like(pattern),
            Filter::In { column, values } => {
                let value = record.value(column);
                values.iter().any(|v| value.compare(v) == Ordering::Equal)
            }
            Filter::IsNull { column } => record.value(column).is_null(),
            Filter::SubQuery { columns, rows } => match rows {
                Some(rows) => {
                    let tuple: Vec<Value> = columns.iter().map(|c| record.value(c)).collect();
                    rows.iter().any(|row| {
                        row.len() == tuple.len()
                            && row
                                .iter()
                                .zip(&tuple)
                                .all(|(a, b)| a.compare(b) == Ordering::Equal)
                    })
                }
                None => {
                    tracing::debug!("unresolved subquery evaluated client-side, not constraining");
                    true
                }
            },
        }
    }

    /// Column/value pairs this leaf would bind in a backend statement.
    pub fn bind_values(&self) -> Vec<(String, Value)> {
        match self {
            Filter::Equals { column, value }
            | Filter::NotEquals { column, value }
            | Filter::GreaterThan { column, value, .. }
            | Filter::LessThan { column, value, .. } => vec![(column.clone(), value.clone())],
            Filter::Between {
                column,
                lower,
                upper,
            } => vec![(column.clone(), lower.clone()), (column.clone(), upper.clone())],
            Filter::Like { column, pattern } => {
                vec![(column.clone(), Value::Text(pattern.clone()))]
            }
            Filter::In { column, values } => values
                .iter()
                .map(|v| (column.clone(), v.clone()))
                .collect(),
            Filter::IsNull { .. } | Filter::SubQuery { .. } => vec![],
        }
    }
}

/// Tree of filters, sectioned by origin, combined by AND.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterStructure {
    name: Option<String>,
    filters: Vec<Filter>,
    groups: IndexMap<String, FilterStructure>,
}

impl FilterStructure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// True iff no leaf contributes a constraint.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.groups.values().all(|g| g.is_empty())
    }

    /// AND a leaf filter into the anonymous section.
    pub fn and(&mut self, filter: Filter) -> &mut Self {
        self.filters.push(filter);
        self
    }

    /// AND a leaf filter into a named section, creating it on demand.
    pub fn and_in(&mut self, section: &str, filter: Filter) -> &mut Self {
        self.groups
            .entry(section.to_string())
            .or_insert_with(|| FilterStructure::named(section))
            .and(filter);
        self
    }

    /// AND a whole structure into a named section. Adding an empty
    /// structure is a no-op, which keeps `and` associative.
    pub fn and_structure(&mut self, section: &str, structure: FilterStructure) -> &mut Self {
        if structure.is_empty() {
            return self;
        }

        match self.groups.get_mut(section) {
            Some(existing) => {
                existing.filters.extend(structure.filters);
                for (name, group) in structure.groups {
                    existing.and_structure(&name, group);
                }
            }
            None => {
                self.groups.insert(section.to_string(), structure);
            }
        }

        self
    }

    /// The named section, if present.
    pub fn get(&self, section: &str) -> Option<&FilterStructure> {
        self.groups.get(section)
    }

    /// Leaf filters of this structure, recursively.
    pub fn leaves(&self) -> Vec<&Filter> {
        let mut all: Vec<&Filter> = self.filters.iter().collect();
        for group in self.groups.values() {
            all.extend(group.leaves());
        }
        all
    }

    /// Bind values of one section's leaves, recursively.
    pub fn bind_values(&self, section: &str) -> Vec<(String, Value)> {
        self.get(section)
            .map(|g| g.leaves().iter().flat_map(|f| f.bind_values()).collect())
            .unwrap_or_default()
    }

    /// Remove and return every sub-query leaf, recursively. Cursor-backed
    /// sources use this to split predicates the backend cannot express off
    /// into their residual filter.
    pub fn drain_subqueries(&mut self) -> Vec<Filter> {
        let mut drained = Vec::new();

        let mut kept = Vec::new();
        for filter in self.filters.drain(..) {
            if matches!(filter, Filter::SubQuery { .. }) {
                drained.push(filter);
            } else {
                kept.push(filter);
            }
        }
        self.filters = kept;

        for group in self.groups.values_mut() {
            drained.extend(group.drain_subqueries());
        }

        drained
    }

    pub fn clear(&mut self) {
        self.filters.clear();
        self.groups.clear();
    }

    /// Evaluate the whole tree against a record.
    pub fn evaluate(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| f.evaluate(record))
            && self.groups.values().all(|g| g.evaluate(record))
    }
}
