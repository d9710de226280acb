use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::flush::PreparedWrite;
use crate::core::{DbError, Record, Result, Value};
use crate::mapping::{AuditContext, Entity, EntityMeta, RelationKind, unknown_field};
use crate::storage::ExecOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Saved in the session, not yet inserted.
    New,
    Managed,
    /// Staged for delete at the next flush.
    Removed,
    /// Dropped from its session by `clear`; changes are no longer tracked.
    Detached,
}

/// Builds a managed cell from a row; one instantiation per registered
/// entity type.
pub(crate) type Loader = fn(u64, &Record, bool) -> Result<Arc<dyn ManagedEntity>>;

pub(crate) fn load_cell<E: Entity>(
    seq: u64,
    record: &Record,
    read_only: bool,
) -> Result<Arc<dyn ManagedEntity>> {
    let entity = E::from_record(record)?;
    let synced = entity.to_record();
    Ok(Arc::new(EntityCell::new(
        seq,
        entity,
        EntityState::Managed,
        Some(synced),
        read_only,
    )))
}

pub(super) struct PendingReference {
    pub fk_field: &'static str,
    pub target: Arc<dyn ManagedEntity>,
}

pub(super) struct Tracking {
    pub state: EntityState,
    /// What the store holds for this entity, as of the last read or write.
    pub synced: Option<Record>,
    /// Columns assigned through `Managed::set` since then.
    pub dirty: BTreeSet<&'static str>,
    pub pending: Vec<PendingReference>,
}

pub(crate) struct EntityCell<E: Entity> {
    pub(super) seq: u64,
    pub(super) read_only: bool,
    pub(super) tracking: Mutex<Tracking>,
    pub(super) entity: Mutex<E>,
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: Entity> EntityCell<E> {
    pub(crate) fn new(
        seq: u64,
        entity: E,
        state: EntityState,
        synced: Option<Record>,
        read_only: bool,
    ) -> Self {
        Self {
            seq,
            read_only,
            tracking: Mutex::new(Tracking {
                state,
                synced,
                dirty: BTreeSet::new(),
                pending: Vec::new(),
            }),
            entity: Mutex::new(entity),
        }
    }
}

/// Type-erased view of a cell, as held by the identity map.
pub(crate) trait ManagedEntity: Send + Sync {
    fn meta(&self) -> &'static EntityMeta;

    fn seq(&self) -> u64;

    fn current_id(&self) -> Option<i64>;

    fn state(&self) -> EntityState;

    fn label(&self) -> String;

    fn mark_removed(&self);

    fn detach(&self);

    fn prepare_write(&self, audit: &AuditContext) -> Result<Option<PreparedWrite>>;

    fn complete_write(&self, write: PreparedWrite, outcome: ExecOutcome) -> Result<()>;

    fn abort_write(&self, write: &PreparedWrite);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<E: Entity> ManagedEntity for EntityCell<E> {
    fn meta(&self) -> &'static EntityMeta {
        E::meta()
    }

    fn seq(&self) -> u64 {
        self.seq
    }

    fn current_id(&self) -> Option<i64> {
        lock(&self.entity).id()
    }

    fn state(&self) -> EntityState {
        lock(&self.tracking).state
    }

    fn label(&self) -> String {
        match self.current_id() {
            Some(id) => format!("{}#{}", E::meta().name, id),
            None => format!("{}(unsaved)", E::meta().name),
        }
    }

    fn mark_removed(&self) {
        let mut tracking = lock(&self.tracking);
        tracking.state = EntityState::Removed;
        tracking.pending.clear();
    }

    fn detach(&self) {
        let mut tracking = lock(&self.tracking);
        tracking.state = EntityState::Detached;
        tracking.dirty.clear();
        tracking.pending.clear();
    }

    fn prepare_write(&self, audit: &AuditContext) -> Result<Option<PreparedWrite>> {
        self.prepare(audit)
    }

    fn complete_write(&self, write: PreparedWrite, outcome: ExecOutcome) -> Result<()> {
        self.complete(write, outcome)
    }

    fn abort_write(&self, write: &PreparedWrite) {
        self.abort(write)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Handle to the one in-memory instance of an entity within a session.
///
/// Clones share the instance. Changes go through [`set`](Self::set),
/// [`modify`](Self::modify) and [`set_reference`](Self::set_reference) and
/// are written at the next flush.
pub struct Managed<E: Entity> {
    cell: Arc<EntityCell<E>>,
}

impl<E: Entity> Clone for Managed<E> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<E: Entity> fmt::Debug for Managed<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed")
            .field("state", &self.state())
            .field("entity", &*lock(&self.cell.entity))
            .finish()
    }
}

impl<E: Entity> Managed<E> {
    pub(crate) fn new(cell: Arc<EntityCell<E>>) -> Self {
        Self { cell }
    }

    pub(crate) fn erased(&self) -> Arc<dyn ManagedEntity> {
        self.cell.clone()
    }

    pub(crate) fn downcast(erased: Arc<dyn ManagedEntity>) -> Result<Self> {
        let meta = erased.meta();
        erased
            .as_any()
            .downcast::<EntityCell<E>>()
            .map(Self::new)
            .map_err(|_| {
                DbError::TypeMismatch(format!(
                    "managed instance is a {}, not a {}",
                    meta.name,
                    E::meta().name
                ))
            })
    }

    pub(crate) fn seq(&self) -> u64 {
        self.cell.seq
    }

    /// Both handles point at the same in-memory instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }

    pub fn id(&self) -> Option<i64> {
        lock(&self.cell.entity).id()
    }

    pub fn snapshot(&self) -> E {
        lock(&self.cell.entity).clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&E) -> R) -> R {
        f(&*lock(&self.cell.entity))
    }

    pub fn state(&self) -> EntityState {
        lock(&self.cell.tracking).state
    }

    pub fn is_new(&self) -> bool {
        self.state() == EntityState::New
    }

    pub fn is_read_only(&self) -> bool {
        self.cell.read_only
    }

    /// Whether the next flush would write this entity.
    pub fn is_dirty(&self) -> bool {
        let tracking = lock(&self.cell.tracking);
        match tracking.state {
            EntityState::New | EntityState::Removed => true,
            EntityState::Detached => false,
            EntityState::Managed if self.cell.read_only => false,
            EntityState::Managed => {
                !tracking.dirty.is_empty()
                    || !tracking.pending.is_empty()
                    || tracking.synced.as_ref() != Some(&lock(&self.cell.entity).to_record())
            }
        }
    }

    /// Assigns a field and records the column for the next flush. Read-only
    /// instances change in memory only.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let meta = E::meta();
        if field == meta.id_field {
            return Err(DbError::Validation(format!(
                "{}.{} is the key and cannot be reassigned",
                meta.name, field
            )));
        }
        let column = meta
            .column_for(field)
            .ok_or_else(|| unknown_field(meta, field))?;

        let mut tracking = lock(&self.cell.tracking);
        lock(&self.cell.entity).set_field(field, value.into())?;
        tracking.pending.retain(|pending| pending.fk_field != field);
        if !self.cell.read_only {
            tracking.dirty.insert(column);
        }
        Ok(())
    }

    /// Mutates the instance in place; changes are found by comparison at
    /// flush time.
    pub fn modify<R>(&self, f: impl FnOnce(&mut E) -> R) -> R {
        f(&mut *lock(&self.cell.entity))
    }

    /// Points a many-to-one relation at `target`. An unsaved target is
    /// resolved to its key when this entity is flushed.
    pub fn set_reference<T: Entity>(&self, relation: &str, target: &Managed<T>) -> Result<()> {
        let fk_field = many_to_one::<E, T>(relation)?;
        match target.id() {
            Some(id) => self.set(fk_field, id),
            None => {
                let mut tracking = lock(&self.cell.tracking);
                tracking.pending.retain(|pending| pending.fk_field != fk_field);
                tracking.pending.push(PendingReference {
                    fk_field,
                    target: target.erased(),
                });
                Ok(())
            }
        }
    }

    pub fn clear_reference(&self, relation: &str) -> Result<()> {
        let meta = E::meta();
        match meta.relation(relation).map(|relation| relation.kind) {
            Some(RelationKind::ManyToOne { fk_field }) => self.set(fk_field, Value::Null),
            _ => Err(DbError::Validation(format!(
                "{}.{} is not a many-to-one relation",
                meta.name, relation
            ))),
        }
    }

    /// Replaces the instance's state, as `save` does for a detached copy.
    pub(crate) fn merge(&self, entity: E) {
        *lock(&self.cell.entity) = entity;
    }

    pub(crate) fn column_value(&self, column: &str) -> Value {
        lock(&self.cell.entity)
            .to_record()
            .get(column)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub(crate) fn pending_target(&self, fk_field: &str) -> Option<Arc<dyn ManagedEntity>> {
        lock(&self.cell.tracking)
            .pending
            .iter()
            .find(|pending| pending.fk_field == fk_field)
            .map(|pending| Arc::clone(&pending.target))
    }
}

/// The foreign key field of relation `name` on `E`, checked to point at `T`.
pub(crate) fn many_to_one<E: Entity, T: Entity>(name: &str) -> Result<&'static str> {
    let meta = E::meta();
    match meta.relation(name) {
        Some(relation) if relation.target == T::meta().name => match relation.kind {
            RelationKind::ManyToOne { fk_field } => Ok(fk_field),
            RelationKind::OneToMany { .. } => Err(DbError::Validation(format!(
                "{}.{} is a collection; change the owning side instead",
                meta.name, name
            ))),
        },
        Some(relation) => Err(DbError::Validation(format!(
            "{}.{} targets {}, not {}",
            meta.name,
            name,
            relation.target,
            T::meta().name
        ))),
        None => Err(DbError::Validation(format!(
            "{} has no relation '{}'",
            meta.name, name
        ))),
    }
}
