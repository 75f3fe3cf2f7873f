//! Column value model shared by records, filters and bind values

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single column value.
///
/// Values carry a total order so sorting and range filters behave the same
/// for every datasource. Values of different kinds order by kind first;
/// integers and floats compare numerically against each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
    Date(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Kind rank used when comparing values of different kinds.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Number(_) => 2,
            Value::Text(_) => 3,
            Value::Date(_) => 4,
        }
    }

    /// Total-order comparison. Null sorts first.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::Int(a), Value::Number(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::Number(a), Value::Int(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// SQL LIKE match against `pattern` (`%` and `_` wildcards),
    /// case-insensitive. Non-text values match against their display form.
    pub fn like(&self, pattern: &str) -> bool {
        if self.is_null() {
            return false;
        }

        let text = self.to_string().to_lowercase();
        let pattern = pattern.to_lowercase();

        like_match(
            &text.chars().collect::<Vec<_>>(),
            &pattern.chars().collect::<Vec<_>>(),
        )
    }
}

fn like_match(text: &[char], pattern: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('%') => {
            (0..=text.len()).any(|skip| like_match(&text[skip..], &pattern[1..]))
        }
        Some('_') => !text.is_empty() && like_match(&text[1..], &pattern[1..]),
        Some(c) => text.first() == Some(c) && like_match(&text[1..], &pattern[1..]),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total_across_kinds() {
        assert_eq!(Value::Null.compare(&Value::Int(0)), Ordering::Less);
        assert_eq!(Value::Int(3).compare(&Value::Number(3.5)), Ordering::Less);
        assert_eq!(Value::Number(2.0).compare(&Value::Int(2)), Ordering::Equal);
        assert_eq!(
            Value::Text("b".into()).compare(&Value::Text("a".into())),
            Ordering::Greater
        );
        assert_eq!(Value::Int(9).compare(&Value::Text("1".into())), Ordering::Less);
    }

    #[test]
    fn like_handles_wildcards() {
        assert!(Value::Text("Hammond".into()).like("ham%"));
        assert!(Value::Text("Hammond".into()).like("%mon_"));
        assert!(Value::Text("Hammond".into()).like("h_mmond"));
        assert!(!Value::Text("Hammond".into()).like("ham"));
        assert!(Value::Int(1234).like("12%"));
        assert!(!Value::Null.like("%"));
    }
}
