use std::cmp::Ordering;

use super::TableSchema;
use crate::core::{DbError, Result, Row, Value};
use crate::statement::{ArithOp, ColumnRef, CompareOp, Condition, Expr, Operand};

/// Row sources visible to an expression, in FROM/JOIN order.
pub(crate) struct Scope<'a> {
    sources: Vec<(&'a str, &'a TableSchema)>,
}

/// One joined row: a slot per source, `None` for an unmatched LEFT JOIN.
pub(crate) type Tuple<'a> = Vec<Option<&'a Row>>;

impl<'a> Scope<'a> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn push(&mut self, alias: &'a str, schema: &'a TableSchema) -> Result<()> {
        if self.sources.iter().any(|(existing, _)| *existing == alias) {
            return Err(DbError::ExecutionError(format!(
                "Alias '{}' is used twice",
                alias
            )));
        }
        self.sources.push((alias, schema));
        Ok(())
    }

    pub fn source(&self, alias: &str) -> Result<usize> {
        self.sources
            .iter()
            .position(|(existing, _)| *existing == alias)
            .ok_or_else(|| DbError::ExecutionError(format!("Unknown alias '{}'", alias)))
    }

    pub fn schema(&self, source: usize) -> &'a TableSchema {
        self.sources[source].1
    }

    pub fn alias(&self, source: usize) -> &'a str {
        self.sources[source].0
    }

    pub fn resolve(&self, column: &ColumnRef) -> Result<(usize, usize)> {
        let source = self.source(&column.alias)?;
        let schema = self.schema(source);
        let col_idx = schema
            .schema()
            .find_column_index(&column.column)
            .ok_or_else(|| {
                DbError::ColumnNotFound(column.column.clone(), schema.name().to_string())
            })?;
        Ok((source, col_idx))
    }

    pub fn value(&self, tuple: &Tuple<'_>, column: &ColumnRef) -> Result<Value> {
        let (source, col_idx) = self.resolve(column)?;
        Ok(tuple[source]
            .map(|row| row[col_idx].clone())
            .unwrap_or(Value::Null))
    }

    pub fn operand(&self, tuple: &Tuple<'_>, operand: &Operand) -> Result<Value> {
        match operand {
            Operand::Column(column) => self.value(tuple, column),
            Operand::Value(value) => Ok(value.clone()),
            Operand::Param(param) => Err(DbError::ExecutionError(format!(
                "Unbound parameter {}",
                param
            ))),
        }
    }

    pub fn expr(&self, tuple: &Tuple<'_>, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Operand(operand) => self.operand(tuple, operand),
            Expr::Arith { left, op, right } => {
                let left = self.expr(tuple, left)?;
                let right = self.expr(tuple, right)?;
                match op {
                    ArithOp::Add => left.add(&right),
                    ArithOp::Sub => left.add(&right.negate()?),
                }
            }
        }
    }

    /// Two-valued evaluation: any comparison against NULL is false.
    pub fn condition(&self, tuple: &Tuple<'_>, condition: &Condition) -> Result<bool> {
        match condition {
            Condition::Compare { left, op, right } => {
                let left = self.operand(tuple, left)?;
                let right = self.operand(tuple, right)?;
                if left.is_null() || right.is_null() {
                    return Ok(false);
                }
                let ordering = left.compare(&right)?;
                Ok(match op {
                    CompareOp::Eq => ordering == Ordering::Equal,
                    CompareOp::NotEq => ordering != Ordering::Equal,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    CompareOp::Ge => ordering != Ordering::Less,
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Le => ordering != Ordering::Greater,
                })
            }
            Condition::In {
                operand,
                list,
                negated,
            } => {
                let value = self.operand(tuple, operand)?;
                if value.is_null() {
                    return Ok(false);
                }
                let items = match self.operand(tuple, list)? {
                    Value::List(items) => items,
                    other => {
                        return Err(DbError::TypeMismatch(format!(
                            "IN expects a collection, got {}",
                            other.type_name()
                        )));
                    }
                };
                let found = items.iter().any(|item| item == &value);
                Ok(found != *negated)
            }
            Condition::IsNull { operand, negated } => {
                let value = self.operand(tuple, operand)?;
                Ok(value.is_null() != *negated)
            }
            Condition::And(terms) => {
                for term in terms {
                    if !self.condition(tuple, term)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(terms) => {
                for term in terms {
                    if self.condition(tuple, term)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// ORDER BY comparison with NULLs last in either direction.
pub(crate) fn order_values(left: &Value, right: &Value, descending: bool) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let ordering = left.compare(right).unwrap_or(Ordering::Equal);
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}
