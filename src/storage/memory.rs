use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::eval::{Scope, Tuple, order_values};
use super::locks::{Blocked, RowLocks, until};
use super::{ExecContext, ExecOutcome, SessionId, Store, Table, TableSchema};
use crate::core::{DbError, Result, Row, Value};
use crate::result::QueryResult;
use crate::statement::{
    Condition, Delete, Direction, Insert, JoinKind, Select, SelectItem, Statement,
    TableRef, Update,
};

/// In-process relational store: one [`Table`] per entity type, statement
/// level atomicity, pessimistic row locks and a log of executed statements.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    /// Signalled whenever row locks are released.
    released: Notify,
    log: StdMutex<Vec<String>>,
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, Table>,
    locks: RowLocks,
}

enum Attempt<T> {
    Done(T),
    Blocked(Blocked),
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            released: Notify::new(),
            log: StdMutex::new(Vec::new()),
        }
    }

    /// SQL text of every statement run so far, in execution order.
    pub fn statements(&self) -> Vec<String> {
        match self.log.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn clear_statements(&self) {
        match self.log.lock() {
            Ok(mut log) => log.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    pub async fn row_count(&self, table: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.table(table)?.row_count())
    }

    pub async fn locks_held_by(&self, owner: SessionId) -> usize {
        self.state.lock().await.locks.held_by(owner)
    }

    fn record(&self, sql: String) {
        tracing::debug!(target: "entity_session::sql", %sql);
        match self.log.lock() {
            Ok(mut log) => log.push(sql),
            Err(poisoned) => poisoned.into_inner().push(sql),
        }
    }

    /// Runs `attempt` under the state lock, waiting for row locks held by
    /// other units of work until they are released, their lease ends or
    /// `ctx.lock_timeout` passes.
    async fn with_row_locks<T>(
        &self,
        ctx: &ExecContext,
        mut attempt: impl FnMut(&mut StoreState) -> Result<Attempt<T>> + Send,
    ) -> Result<T> {
        let deadline = Instant::now() + ctx.lock_timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let blocked = {
                let mut state = self.state.lock().await;
                match attempt(&mut *state)? {
                    Attempt::Done(value) => return Ok(value),
                    Attempt::Blocked(blocked) => blocked,
                }
            };

            if Instant::now() >= deadline {
                return Err(DbError::LockTimeout(format!(
                    "row locked by unit of work {} for more than {:?}",
                    blocked.owner, ctx.lock_timeout
                )));
            }
            tracing::debug!(
                owner = %ctx.owner,
                holder = %blocked.owner,
                "waiting for row lock"
            );
            let wake_at = deadline.min(blocked.expires_at);
            let _ = tokio::time::timeout(until(wake_at), notified).await;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_table(&self, schema: TableSchema) -> Result<()> {
        tracing::debug!(target: "entity_session::sql", sql = %schema);
        let mut state = self.state.lock().await;
        if state.tables.contains_key(schema.name()) {
            return Err(DbError::TableExists(schema.name().to_string()));
        }
        for column in schema.columns() {
            if let Some(fk) = &column.references
                && fk.table != schema.name()
                && !state.tables.contains_key(&fk.table)
            {
                return Err(DbError::TableNotFound(fk.table.clone()));
            }
        }
        let name = schema.name().to_string();
        state.tables.insert(name, Table::new(schema)?);
        Ok(())
    }

    async fn query(&self, ctx: &ExecContext, select: &Select) -> Result<QueryResult> {
        self.record(select.to_string());
        if select.lock.is_none() {
            let state = self.state.lock().await;
            return run_select(&state.tables, select).map(|(result, _)| result);
        }

        self.with_row_locks(ctx, |state| {
            let (result, ids) = run_select(&state.tables, select)?;
            if let Some(blocked) = state.locks.blocker(ctx, &select.from.table, &ids) {
                return Ok(Attempt::Blocked(blocked));
            }
            state.locks.acquire(ctx, &select.from.table, &ids);
            Ok(Attempt::Done(result))
        })
        .await
    }

    async fn execute(&self, ctx: &ExecContext, statement: &Statement) -> Result<ExecOutcome> {
        match statement {
            Statement::Select(select) => {
                let result = self.query(ctx, select).await?;
                Ok(ExecOutcome {
                    affected: result.row_count() as u64,
                    generated_id: None,
                })
            }
            Statement::Insert(insert) => {
                self.record(statement.to_string());
                let mut state = self.state.lock().await;
                let id = state.insert(insert)?;
                Ok(ExecOutcome {
                    affected: 1,
                    generated_id: Some(id),
                })
            }
            Statement::Update(update) => {
                self.record(statement.to_string());
                let affected = self
                    .with_row_locks(ctx, |state| {
                        let ids = state.matching_ids(&update.table, &update.filter)?;
                        if let Some(blocked) = state.locks.blocker(ctx, &update.table.table, &ids)
                        {
                            return Ok(Attempt::Blocked(blocked));
                        }
                        state.apply_update(update, &ids).map(Attempt::Done)
                    })
                    .await?;
                Ok(ExecOutcome {
                    affected,
                    generated_id: None,
                })
            }
            Statement::Delete(delete) => {
                self.record(statement.to_string());
                let affected = self
                    .with_row_locks(ctx, |state| {
                        let ids = state.matching_ids(&delete.table, &delete.filter)?;
                        if let Some(blocked) = state.locks.blocker(ctx, &delete.table.table, &ids)
                        {
                            return Ok(Attempt::Blocked(blocked));
                        }
                        state.apply_delete(delete, &ids).map(Attempt::Done)
                    })
                    .await?;
                Ok(ExecOutcome {
                    affected,
                    generated_id: None,
                })
            }
        }
    }

    async fn release_locks(&self, owner: SessionId) -> Result<usize> {
        let released = {
            let mut state = self.state.lock().await;
            state.locks.release(owner)
        };
        if released > 0 {
            tracing::debug!(%owner, released, "row locks released");
            self.released.notify_waiters();
        }
        Ok(released)
    }
}

impl StoreState {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    fn insert(&mut self, insert: &Insert) -> Result<i64> {
        if insert.columns.len() != insert.values.len() {
            return Err(DbError::ExecutionError(format!(
                "INSERT into '{}' names {} columns but supplies {} values",
                insert.table,
                insert.columns.len(),
                insert.values.len()
            )));
        }
        let schema = self.table(&insert.table)?.schema();
        let mut row: Row = vec![Value::Null; schema.columns().len()];
        for (column, value) in insert.columns.iter().zip(&insert.values) {
            let idx = schema.schema().find_column_index(column).ok_or_else(|| {
                DbError::ColumnNotFound(column.clone(), insert.table.clone())
            })?;
            row[idx] = value.clone();
        }
        self.check_references(schema, &row)?;

        let table = self
            .tables
            .get_mut(&insert.table)
            .ok_or_else(|| DbError::TableNotFound(insert.table.clone()))?;
        table.insert(row)
    }

    fn matching_ids(&self, table_ref: &TableRef, filter: &Option<Condition>) -> Result<Vec<i64>> {
        let table = self.table(&table_ref.table)?;
        let mut scope = Scope::new();
        scope.push(&table_ref.alias, table.schema())?;
        let mut ids = Vec::new();
        for (id, row) in table.scan() {
            let tuple: Tuple<'_> = vec![Some(row)];
            let keep = match filter {
                Some(condition) => scope.condition(&tuple, condition)?,
                None => true,
            };
            if keep {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Applies all assignments or none of them.
    fn apply_update(&mut self, update: &Update, ids: &[i64]) -> Result<u64> {
        let table = self.table(&update.table.table)?;
        let schema = table.schema();
        let mut scope = Scope::new();
        scope.push(&update.table.alias, schema)?;

        let mut new_rows = Vec::with_capacity(ids.len());
        for id in ids {
            let row = table.get(*id).ok_or_else(|| {
                DbError::ExecutionError(format!("Row {} vanished during update", id))
            })?;
            let tuple: Tuple<'_> = vec![Some(row)];
            let mut new_row = row.clone();
            for assignment in &update.assignments {
                let idx = schema
                    .schema()
                    .find_column_index(&assignment.column)
                    .ok_or_else(|| {
                        DbError::ColumnNotFound(
                            assignment.column.clone(),
                            update.table.table.clone(),
                        )
                    })?;
                new_row[idx] = scope.expr(&tuple, &assignment.value)?;
            }
            self.check_references(schema, &new_row)?;
            new_rows.push((*id, new_row));
        }

        let mut staged = table.clone();
        for (id, row) in new_rows {
            staged.update(id, row)?;
        }
        self.tables.insert(update.table.table.clone(), staged);
        Ok(ids.len() as u64)
    }

    fn apply_delete(&mut self, delete: &Delete, ids: &[i64]) -> Result<u64> {
        let name = &delete.table.table;
        for (other_name, other) in &self.tables {
            for (idx, column) in other.schema().columns().iter().enumerate() {
                let Some(fk) = &column.references else {
                    continue;
                };
                if &fk.table != name {
                    continue;
                }
                for id in ids {
                    if other.contains_value(idx, &Value::Integer(*id)) {
                        return Err(DbError::ConstraintViolation(format!(
                            "Delete of {}({}) violates foreign key constraint from {}.{}",
                            name, id, other_name, column.name
                        )));
                    }
                }
            }
        }

        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| DbError::TableNotFound(name.clone()))?;
        let mut affected = 0;
        for id in ids {
            if table.delete(*id) {
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn check_references(&self, schema: &TableSchema, row: &Row) -> Result<()> {
        for (column, value) in schema.columns().iter().zip(row.iter()) {
            let Some(fk) = &column.references else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let target = self.table(&fk.table)?;
            let present = match value {
                Value::Integer(id) => target.get(*id).is_some(),
                _ => false,
            };
            if !present {
                return Err(DbError::ConstraintViolation(format!(
                    "Foreign key violation: {}.{} = {} references non-existent key in {}({})",
                    schema.name(),
                    column.name,
                    value,
                    fk.table,
                    fk.column
                )));
            }
        }
        Ok(())
    }
}

/// Evaluates a select, returning the projected result and the primary keys
/// of the root rows it covers.
fn run_select(tables: &HashMap<String, Table>, select: &Select) -> Result<(QueryResult, Vec<i64>)> {
    let lookup = |name: &str| {
        tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    };

    let root = lookup(&select.from.table)?;
    let mut scope = Scope::new();
    scope.push(&select.from.alias, root.schema())?;
    let mut tuples: Vec<Tuple<'_>> = root.scan().map(|(_, row)| vec![Some(row)]).collect();

    for join in &select.joins {
        let joined = lookup(&join.table.table)?;
        scope.push(&join.table.alias, joined.schema())?;
        let (inner, outer) = if join.right.alias == join.table.alias {
            (&join.right, &join.left)
        } else if join.left.alias == join.table.alias {
            (&join.left, &join.right)
        } else {
            return Err(DbError::ExecutionError(format!(
                "Join condition does not reference '{}'",
                join.table.alias
            )));
        };
        let (_, inner_idx) = scope.resolve(inner)?;

        let mut next = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let key = scope.value(&tuple, outer)?;
            let mut matched = false;
            if !key.is_null() {
                for (_, row) in joined.scan() {
                    if row[inner_idx] == key {
                        let mut extended = tuple.clone();
                        extended.push(Some(row));
                        next.push(extended);
                        matched = true;
                    }
                }
            }
            if !matched && join.kind == JoinKind::Left {
                let mut extended = tuple;
                extended.push(None);
                next.push(extended);
            }
        }
        tuples = next;
    }

    if let Some(filter) = &select.filter {
        let mut kept = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            if scope.condition(&tuple, filter)? {
                kept.push(tuple);
            }
        }
        tuples = kept;
    }

    if select.items.contains(&SelectItem::CountAll) {
        if select.items.len() > 1 {
            return Err(DbError::ExecutionError(
                "COUNT(*) cannot be combined with other columns".into(),
            ));
        }
        return Ok((
            QueryResult::new(
                vec!["count".to_string()],
                vec![vec![Value::Integer(tuples.len() as i64)]],
            ),
            Vec::new(),
        ));
    }

    if !select.order_by.is_empty() {
        let mut keyed = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let keys = select
                .order_by
                .iter()
                .map(|order| scope.value(&tuple, &order.column))
                .collect::<Result<Vec<_>>>()?;
            keyed.push((keys, tuple));
        }
        keyed.sort_by(|(left, _), (right, _)| {
            for (idx, order) in select.order_by.iter().enumerate() {
                let ordering =
                    order_values(&left[idx], &right[idx], order.direction == Direction::Desc);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        tuples = keyed.into_iter().map(|(_, tuple)| tuple).collect();
    }

    let offset = select.offset.unwrap_or(0);
    let limit = select.limit.unwrap_or(usize::MAX);
    let tuples: Vec<Tuple<'_>> = tuples.into_iter().skip(offset).take(limit).collect();

    let key_index = root.key_index();
    let mut root_ids: Vec<i64> = tuples
        .iter()
        .filter_map(|tuple| tuple[0].and_then(|row| row[key_index].as_i64()))
        .collect();
    root_ids.sort_unstable();
    root_ids.dedup();

    if select.items.is_empty() {
        return Err(DbError::ExecutionError("SELECT without columns".into()));
    }
    let mut columns = Vec::new();
    let mut cells = Vec::new();
    for item in &select.items {
        match item {
            SelectItem::AllColumns(alias) => {
                let source = scope.source(alias)?;
                for (idx, column) in scope.schema(source).columns().iter().enumerate() {
                    columns.push(format!("{}.{}", scope.alias(source), column.name));
                    cells.push((source, idx));
                }
            }
            SelectItem::Column(column) => {
                columns.push(column.to_string());
                cells.push(scope.resolve(column)?);
            }
            SelectItem::CountAll => {}
        }
    }

    let rows = tuples
        .iter()
        .map(|tuple| {
            cells
                .iter()
                .map(|(source, idx)| {
                    tuple[*source]
                        .map(|row| row[*idx].clone())
                        .unwrap_or(Value::Null)
                })
                .collect()
        })
        .collect();

    Ok((QueryResult::new(columns, rows), root_ids))
}
