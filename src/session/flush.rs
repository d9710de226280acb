use std::collections::BTreeSet;
use std::sync::Arc;

use super::Session;
use super::managed::{EntityCell, EntityState, ManagedEntity, Tracking, lock};
use crate::core::{DbError, Record, Result, Value};
use crate::mapping::{AuditContext, Entity};
use crate::statement::{
    Assignment, ColumnRef, Condition, Delete, Expr, Insert, Operand, Statement, TableRef, Update,
};
use crate::storage::ExecOutcome;

const ALIAS: &str = "e";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update { versioned: bool },
    Delete { versioned: bool },
}

/// One write statement for one entity, built before it is sent so the
/// entity's locks are never held across the store call.
pub(crate) struct PreparedWrite {
    pub statement: Statement,
    kind: WriteKind,
    /// The entity's record once the write lands.
    record: Record,
    /// Version to restore when the write does not land.
    previous_version: Option<i64>,
}

impl PreparedWrite {
    fn is_delete(&self) -> bool {
        matches!(self.kind, WriteKind::Delete { .. })
    }
}

fn key_filter<E: Entity>(id: i64, version: Option<i64>) -> Option<Condition> {
    let meta = E::meta();
    let mut terms = vec![Condition::eq(
        Operand::Column(ColumnRef::new(ALIAS, meta.id_column)),
        Operand::Value(Value::Integer(id)),
    )];
    if let (Some(column), Some(version)) = (meta.version_column(), version) {
        terms.push(Condition::eq(
            Operand::Column(ColumnRef::new(ALIAS, column)),
            Operand::Value(Value::Integer(version)),
        ));
    }
    Condition::all(terms)
}

impl<E: Entity> EntityCell<E> {
    pub(super) fn prepare(&self, audit: &AuditContext) -> Result<Option<PreparedWrite>> {
        let meta = E::meta();
        let mut tracking = lock(&self.tracking);
        match tracking.state {
            EntityState::Detached => Ok(None),
            EntityState::Removed => {
                let entity = lock(&self.entity);
                let Some(id) = entity.id() else {
                    return Ok(None);
                };
                let version = entity.version();
                Ok(Some(PreparedWrite {
                    statement: Statement::Delete(Delete {
                        table: TableRef::new(meta.table, ALIAS),
                        filter: key_filter::<E>(id, version),
                    }),
                    kind: WriteKind::Delete {
                        versioned: meta.version_field.is_some() && version.is_some(),
                    },
                    record: Record::new(),
                    previous_version: None,
                }))
            }
            EntityState::New => {
                self.resolve_references(&mut tracking)?;
                let mut entity = lock(&self.entity);
                entity.on_persist(audit);
                if meta.version_field.is_some() && entity.version().is_none() {
                    entity.set_version(0);
                }
                let record = entity.to_record();

                let mut columns = Vec::with_capacity(record.len() + 1);
                let mut values = Vec::with_capacity(record.len() + 1);
                if let Some(id) = entity.id() {
                    columns.push(meta.id_column.to_string());
                    values.push(Value::Integer(id));
                }
                for (column, value) in record.iter() {
                    columns.push(column.clone());
                    values.push(value.clone());
                }
                Ok(Some(PreparedWrite {
                    statement: Statement::Insert(Insert {
                        table: meta.table.to_string(),
                        columns,
                        values,
                    }),
                    kind: WriteKind::Insert,
                    record,
                    previous_version: None,
                }))
            }
            EntityState::Managed if self.read_only => Ok(None),
            EntityState::Managed => {
                self.resolve_references(&mut tracking)?;
                let mut entity = lock(&self.entity);
                let id = entity.id().ok_or_else(|| {
                    DbError::ExecutionError(format!("managed {} has no key", meta.name))
                })?;
                let synced = tracking.synced.clone().unwrap_or_default();

                let mut changed: BTreeSet<String> =
                    tracking.dirty.iter().map(|column| column.to_string()).collect();
                changed.extend(entity.to_record().changed_columns(&synced));
                if changed.is_empty() {
                    return Ok(None);
                }

                entity.on_update(audit);
                let previous_version = entity.version();
                let versioned = meta.version_field.is_some() && previous_version.is_some();
                if let Some(version) = previous_version
                    && versioned
                {
                    entity.set_version(version + 1);
                }
                let record = entity.to_record();
                changed.extend(record.changed_columns(&synced));

                let assignments = changed
                    .iter()
                    .filter_map(|column| {
                        record.get(column).map(|value| Assignment {
                            column: column.clone(),
                            value: Expr::Operand(Operand::Value(value.clone())),
                        })
                    })
                    .collect();
                Ok(Some(PreparedWrite {
                    statement: Statement::Update(Update {
                        table: TableRef::new(meta.table, ALIAS),
                        assignments,
                        filter: key_filter::<E>(id, previous_version.filter(|_| versioned)),
                    }),
                    kind: WriteKind::Update { versioned },
                    record,
                    previous_version,
                }))
            }
        }
    }

    /// Copies the keys of referenced entities into their foreign key fields.
    fn resolve_references(&self, tracking: &mut Tracking) -> Result<()> {
        let meta = E::meta();
        let mut resolved = Vec::with_capacity(tracking.pending.len());
        for pending in &tracking.pending {
            let target_id = if pending.target.seq() == self.seq {
                None
            } else {
                pending.target.current_id()
            };
            match target_id {
                Some(id) => resolved.push((pending.fk_field, id)),
                None => {
                    return Err(DbError::TransientReference(format!(
                        "{}.{} points at {}, which has not been flushed",
                        meta.name,
                        pending.fk_field,
                        pending.target.label()
                    )));
                }
            }
        }
        for (fk_field, id) in resolved {
            lock(&self.entity).set_field(fk_field, Value::Integer(id))?;
            if let Some(column) = meta.column_for(fk_field) {
                tracking.dirty.insert(column);
            }
        }
        tracking.pending.clear();
        Ok(())
    }

    pub(super) fn complete(&self, write: PreparedWrite, outcome: ExecOutcome) -> Result<()> {
        let mut tracking = lock(&self.tracking);
        match write.kind {
            WriteKind::Insert => {
                let mut entity = lock(&self.entity);
                if entity.id().is_none() {
                    let id = outcome.generated_id.ok_or_else(|| {
                        DbError::ExecutionError("insert returned no generated key".into())
                    })?;
                    entity.set_id(id);
                }
                tracking.state = EntityState::Managed;
            }
            WriteKind::Update { versioned } | WriteKind::Delete { versioned }
                if outcome.affected == 0 =>
            {
                drop(tracking);
                self.abort(&write);
                let reason = if versioned {
                    "was modified by another unit of work"
                } else {
                    "no longer exists"
                };
                return Err(DbError::ConcurrencyConflict(format!(
                    "{} {}",
                    self.label(),
                    reason
                )));
            }
            WriteKind::Update { .. } => {}
            WriteKind::Delete { .. } => return Ok(()),
        }
        tracking.synced = Some(write.record);
        tracking.dirty.clear();
        Ok(())
    }

    pub(super) fn abort(&self, write: &PreparedWrite) {
        if let Some(version) = write.previous_version {
            lock(&self.entity).set_version(version);
        }
    }
}

fn flush_failed(cell: &Arc<dyn ManagedEntity>, source: DbError) -> DbError {
    DbError::FlushFailed {
        entity: cell.label(),
        source: Box::new(source),
    }
}

impl Session {
    /// Writes every pending change, one statement per entity, in the order
    /// the entities joined the session. Stops at the first rejected write;
    /// statements already applied stay applied.
    pub async fn flush(&self) -> Result<usize> {
        let cells = self.map()?.in_order();
        let audit = AuditContext::new(self.config.auditor.clone());
        let mut written = 0;

        for cell in cells {
            let prepared = cell
                .prepare_write(&audit)
                .map_err(|err| flush_failed(&cell, err))?;
            let Some(write) = prepared else {
                if cell.state() == EntityState::Removed {
                    self.map()?.evict(cell.seq());
                }
                continue;
            };

            let outcome = match self.store.execute(&self.ctx, &write.statement).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    cell.abort_write(&write);
                    tracing::debug!(entity = %cell.label(), error = %err, "flush rejected");
                    return Err(flush_failed(&cell, err));
                }
            };
            let removed = write.is_delete();
            cell.complete_write(write, outcome)
                .map_err(|err| flush_failed(&cell, err))?;
            written += 1;

            let mut map = self.map()?;
            if removed {
                map.evict(cell.seq());
            } else {
                map.index(&cell);
            }
        }

        if written > 0 {
            tracing::debug!(session = %self.ctx.owner, written, "flush complete");
        }
        Ok(written)
    }

    /// Flushes when the session runs in `FlushMode::Auto`; called before
    /// queries and bulk statements reach the store.
    pub(crate) async fn auto_flush(&self) -> Result<()> {
        if self.config.flush_mode == crate::config::FlushMode::Auto {
            self.flush().await?;
        }
        Ok(())
    }
}
