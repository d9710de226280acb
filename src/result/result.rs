use crate::core::{DbError, Record, Result, Row, Value};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// The single value of a `COUNT(*)` style result.
    pub fn scalar_i64(&self) -> Result<i64> {
        self.rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_i64)
            .ok_or_else(|| DbError::ExecutionError("expected a single integer result".into()))
    }

    /// Extracts the `alias.column` cells of one row into a record keyed by
    /// bare column name.
    pub fn record_for(&self, row: &Row, alias: &str) -> Record {
        let prefix = format!("{}.", alias);
        self.columns
            .iter()
            .zip(row.iter())
            .filter_map(|(name, value)| {
                name.strip_prefix(&prefix)
                    .map(|column| (column.to_string(), value.clone()))
            })
            .collect()
    }
}
