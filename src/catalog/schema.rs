//! Runtime schemas
//!
//! A schema is the ordered column list a tuple is interpreted against.
//! Schemas are value-typed: tables and operators each own their copy.

use serde::{Deserialize, Serialize};

use super::types::DataType;

/// One column of a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// An ordered sequence of columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Create a new empty schema
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    /// Create a schema from (name, type) pairs
    pub fn from_columns(columns: Vec<(String, DataType)>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, data_type)| Column { name, data_type })
                .collect(),
        }
    }

    /// Append a column
    pub fn add_column(&mut self, name: impl Into<String>, data_type: DataType) {
        self.columns.push(Column::new(name, data_type));
    }

    /// Index of the first column with this name. Joined schemas can carry
    /// duplicate names, so lookup is first-match by position.
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Column at a position
    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// All columns in order
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column names in order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the schema has no columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// New schema holding this schema's columns followed by another's
    pub fn join(&self, other: &Schema) -> Schema {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        Schema { columns }
    }
}
