//! Row representation for extracted view data.
//!
//! A row is an ordered list of named, nullable values. Order matters:
//! delimited translators emit values in column order, and the source
//! view's column order is preserved end to end.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One named column value within a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowColumn {
    /// The column name as reported by the view.
    pub name: String,
    /// The column value; `Value::Null` for SQL NULL.
    pub value: Value,
}

impl RowColumn {
    /// Creates a named column value.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One extracted row: column values in the view's column order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    /// The row's columns, in source order.
    pub columns: Vec<RowColumn>,
}

impl Row {
    /// Creates a row from columns in source order.
    #[must_use]
    pub fn new(columns: Vec<RowColumn>) -> Self {
        Self { columns }
    }

    /// Returns the value of the named column, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.value)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            columns: iter
                .into_iter()
                .map(|(name, value)| RowColumn { name, value })
                .collect(),
        }
    }
}
