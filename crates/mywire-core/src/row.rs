//! Decoded row representation.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column labels shared across all rows in a result set.
///
/// Wrapped in `Arc` so all rows from the same result share one copy.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    /// Column labels in order
    names: Vec<String>,
    /// Label -> index mapping for O(1) lookup
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column labels.
    ///
    /// When a label repeats, name lookup resolves to its first occurrence.
    pub fn new(names: Vec<String>) -> Self {
        let mut name_to_index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            name_to_index.entry(name.clone()).or_insert(i);
        }
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single owned row.
///
/// Produced by snapshotting the reader's current row; rows from one result
/// share their [`ColumnInfo`].
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
    big: bool,
}

impl PartialEq for ColumnInfo {
    fn eq(&self, other: &Self) -> bool {
        self.names == other.names
    }
}

impl Row {
    /// Create a row with its own column labels.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self::with_columns(columns, values)
    }

    /// Create a row sharing column labels with its siblings.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        let big = values.iter().any(|v| matches!(v, Value::Spilled(_)));
        Self {
            values,
            columns,
            big,
        }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True if any column was spilled to disk.
    pub fn is_big_row(&self) -> bool {
        self.big
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Iterate over (label, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(self.values.iter())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
