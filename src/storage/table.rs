use std::collections::BTreeMap;
use std::fmt;

use crate::core::{Column, DbError, Result, Row, Schema, Value};

#[derive(Debug, Clone)]
pub struct TableSchema {
    name: String,
    schema: Schema,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            schema: Schema::new(columns),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn columns(&self) -> &[Column] {
        self.schema.columns()
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns: Vec<String> = self
            .columns()
            .iter()
            .map(|column| {
                let mut sql = format!("{} {}", column.name, column.data_type);
                if column.primary_key {
                    sql.push_str(" PRIMARY KEY");
                }
                if column.auto_increment {
                    sql.push_str(" AUTOINCREMENT");
                }
                if !column.nullable && !column.primary_key {
                    sql.push_str(" NOT NULL");
                }
                if column.unique {
                    sql.push_str(" UNIQUE");
                }
                if let Some(fk) = &column.references {
                    sql.push_str(&format!(" REFERENCES {}({})", fk.table, fk.column));
                }
                sql
            })
            .collect();
        write!(f, "CREATE TABLE {} ({})", self.name, columns.join(", "))
    }
}

/// Rows keyed by their integer primary key.
#[derive(Debug, Clone)]
pub struct Table {
    schema: TableSchema,
    key_index: usize,
    rows: BTreeMap<i64, Row>,
    next_id: i64,
}

impl Table {
    pub fn new(schema: TableSchema) -> Result<Self> {
        let key_index = schema.schema().primary_key_index().ok_or_else(|| {
            DbError::ExecutionError(format!("Table '{}' has no primary key", schema.name()))
        })?;
        Ok(Self {
            schema,
            key_index,
            rows: BTreeMap::new(),
            next_id: 1,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn key_index(&self) -> usize {
        self.key_index
    }

    pub fn get(&self, id: i64) -> Option<&Row> {
        self.rows.get(&id)
    }

    pub fn scan(&self) -> impl Iterator<Item = (i64, &Row)> {
        self.rows.iter().map(|(id, row)| (*id, row))
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Inserts a full row, assigning the surrogate key when it is NULL.
    pub fn insert(&mut self, mut row: Row) -> Result<i64> {
        let key_column = &self.schema.columns()[self.key_index];
        let id = match &row[self.key_index] {
            Value::Null if key_column.auto_increment => {
                let id = self.next_id;
                row[self.key_index] = Value::Integer(id);
                id
            }
            Value::Integer(id) => *id,
            other => {
                return Err(DbError::TypeMismatch(format!(
                    "Primary key '{}' must be INTEGER, got {}",
                    key_column.name,
                    other.type_name()
                )));
            }
        };

        if self.rows.contains_key(&id) {
            return Err(DbError::ConstraintViolation(format!(
                "Duplicate primary key {} in table '{}'",
                id,
                self.schema.name()
            )));
        }

        self.validate_row(&row)?;
        self.check_uniqueness(&row, None)?;

        self.next_id = self.next_id.max(id + 1);
        self.rows.insert(id, row);
        Ok(id)
    }

    pub fn update(&mut self, id: i64, row: Row) -> Result<()> {
        if row[self.key_index] != Value::Integer(id) {
            return Err(DbError::ExecutionError(format!(
                "Primary key of table '{}' cannot be updated",
                self.schema.name()
            )));
        }
        self.validate_row(&row)?;
        self.check_uniqueness(&row, Some(id))?;
        match self.rows.get_mut(&id) {
            Some(existing) => {
                *existing = row;
                Ok(())
            }
            None => Err(DbError::ExecutionError(format!(
                "Row {} vanished from table '{}'",
                id,
                self.schema.name()
            ))),
        }
    }

    pub fn delete(&mut self, id: i64) -> bool {
        self.rows.remove(&id).is_some()
    }

    /// Whether any row holds `value` in column `col_idx`.
    pub fn contains_value(&self, col_idx: usize, value: &Value) -> bool {
        self.rows.values().any(|row| &row[col_idx] == value)
    }

    fn check_uniqueness(&self, row: &Row, ignore_id: Option<i64>) -> Result<()> {
        for (col_idx, column) in self.schema.columns().iter().enumerate() {
            if !column.unique {
                continue;
            }
            let value = &row[col_idx];
            if value.is_null() {
                continue;
            }
            let clash = self
                .rows
                .iter()
                .any(|(id, existing)| Some(*id) != ignore_id && &existing[col_idx] == value);
            if clash {
                return Err(DbError::ConstraintViolation(format!(
                    "Unique constraint violation: Column '{}' already contains value {}",
                    column.name, value
                )));
            }
        }
        Ok(())
    }

    fn validate_row(&self, row: &Row) -> Result<()> {
        let columns = self.schema.columns();
        if row.len() != columns.len() {
            return Err(DbError::ExecutionError(format!(
                "Expected {} columns, got {}",
                columns.len(),
                row.len()
            )));
        }
        for (column, value) in columns.iter().zip(row.iter()) {
            column.validate(value)?;
        }
        Ok(())
    }
}
