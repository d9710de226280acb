use std::collections::BTreeMap;

use super::{DataType, DbError, FromValue, Result, Value};

pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    pub references: Option<ForeignKey>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            unique: false,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Integer surrogate key filled in by the store when inserted as NULL.
    pub fn auto_increment_key(mut self) -> Self {
        self.primary_key = true;
        self.auto_increment = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(DbError::ConstraintViolation(format!(
                    "Column '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(DbError::TypeMismatch(format!(
                "Column '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.find_column_index(name).map(|idx| &self.columns[idx])
    }

    pub fn primary_key_index(&self) -> Option<usize> {
        self.columns.iter().position(|col| col.primary_key)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// A row addressed by column name, the unit entities are read from and
/// written to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn get_as<T: FromValue>(&self, column: &str) -> Result<T> {
        let value = self
            .values
            .get(column)
            .ok_or_else(|| DbError::ColumnNotFound(column.to_string(), "record".to_string()))?;
        T::from_value(value).map_err(|err| match err {
            DbError::TypeMismatch(msg) => {
                DbError::TypeMismatch(format!("column '{}': {}", column, msg))
            }
            other => other,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Columns whose value differs from `other` (or is missing there).
    pub fn changed_columns(&self, other: &Record) -> Vec<String> {
        self.values
            .iter()
            .filter(|(column, value)| other.get(column) != Some(*value))
            .map(|(column, _)| column.clone())
            .collect()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_null_column_rejects_null() {
        let column = Column::new("username", DataType::Text).not_null();
        assert!(column.validate(&Value::Null).is_err());
        assert!(column.validate(&Value::from("a")).is_ok());
        assert!(column.validate(&Value::Integer(1)).is_err());
    }

    #[test]
    fn test_record_changed_columns() {
        let before = Record::new().with("age", 10).with("username", "a");
        let after = Record::new().with("age", 11).with("username", "a");
        assert_eq!(after.changed_columns(&before), vec!["age".to_string()]);
    }

    #[test]
    fn test_record_get_as_reports_column() {
        let record = Record::new().with("age", "ten");
        let err = record.get_as::<i64>("age").unwrap_err();
        assert!(err.to_string().contains("age"));
    }
}
