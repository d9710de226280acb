//! The persistence context: one identity map per unit of work.
//!
//! A [`Session`] hands out [`Managed`] handles, guarantees one in-memory
//! instance per `(entity, key)`, records changes and writes them at flush.
//! Sessions share nothing but the store; row locks taken with
//! `SELECT ... FOR UPDATE` belong to the session and are released by
//! [`Session::close`] / [`Session::commit`], or on drop.

mod flush;
mod identity;
mod managed;
mod relations;

pub use managed::{EntityState, Managed};
pub(crate) use managed::{EntityCell, Loader, ManagedEntity, load_cell};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use identity::IdentityMap;

use crate::config::SessionConfig;
use crate::core::{DbError, Record, Result, Value};
use crate::mapping::{Entity, EntityMeta, EntityRegistry};
use crate::result::QueryResult;
use crate::statement::{ColumnRef, Condition, Operand, Select, SelectItem, Statement, TableRef};
use crate::storage::{ExecContext, ExecOutcome, SessionId, Store};

const ROOT: &str = "e";

pub struct Session {
    store: Arc<dyn Store>,
    registry: Arc<EntityRegistry>,
    config: SessionConfig,
    ctx: ExecContext,
    map: Mutex<IdentityMap>,
    /// Set once a locking read ran; cleared when the locks are released.
    holds_locks: AtomicBool,
}

impl Session {
    pub fn new(store: Arc<dyn Store>, registry: Arc<EntityRegistry>, config: SessionConfig) -> Self {
        let ctx = ExecContext::new(
            SessionId::new(),
            config.lock_timeout_duration(),
            config.lock_lease_duration(),
        );
        tracing::debug!(session = %ctx.owner, "session opened");
        Self {
            store,
            registry,
            config,
            ctx,
            map: Mutex::new(IdentityMap::default()),
            holds_locks: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.ctx.owner
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    fn map(&self) -> Result<MutexGuard<'_, IdentityMap>> {
        Ok(self.map.lock()?)
    }

    fn registered<E: Entity>(&self) -> Result<&'static EntityMeta> {
        self.registry.meta(E::meta().name)
    }

    /// Makes `entity` managed. Without a key it is staged for insert; with a
    /// key the stored row (if any) is loaded and overwritten by `entity`.
    pub async fn save<E: Entity>(&self, entity: E) -> Result<Managed<E>> {
        self.registered::<E>()?;
        let Some(id) = entity.id() else {
            return self.persist(entity);
        };
        match self.find::<E>(id).await? {
            Some(existing) => {
                existing.merge(entity);
                Ok(existing)
            }
            None => self.persist(entity),
        }
    }

    /// Stages an insert for an entity that is not yet stored.
    pub fn persist<E: Entity>(&self, entity: E) -> Result<Managed<E>> {
        let meta = self.registered::<E>()?;
        let mut map = self.map()?;
        if let Some(id) = entity.id()
            && map.get(meta.name, id).is_some()
        {
            return Err(DbError::Validation(format!(
                "{}#{} is already managed by this session",
                meta.name, id
            )));
        }
        let seq = map.next_seq();
        let cell = Arc::new(EntityCell::new(seq, entity, EntityState::New, None, false));
        let managed = Managed::new(cell);
        map.insert(managed.erased());
        Ok(managed)
    }

    /// The managed instance for `id`: from the identity map when present,
    /// otherwise read from the store. `None` when no row matches.
    pub async fn find<E: Entity>(&self, id: i64) -> Result<Option<Managed<E>>> {
        let meta = self.registered::<E>()?;
        let cached = self.map()?.get(meta.name, id);
        if let Some(cell) = cached {
            let managed = Managed::<E>::downcast(cell)?;
            if managed.state() == EntityState::Removed {
                return Ok(None);
            }
            return Ok(Some(managed));
        }

        let mut select = Select::from(TableRef::new(meta.table, ROOT));
        select.items = vec![SelectItem::AllColumns(ROOT.to_string())];
        select.filter = Some(Condition::eq(
            Operand::Column(ColumnRef::new(ROOT, meta.id_column)),
            Operand::Value(Value::Integer(id)),
        ));
        let result = self.query(&select).await?;
        let Some(row) = result.rows.first() else {
            return Ok(None);
        };
        let record = result.record_for(row, ROOT);
        let cell = self.resolve(meta, &record, false)?;
        Managed::downcast(cell).map(Some)
    }

    /// Like [`find`](Self::find), failing with `NotFound` on absence.
    pub async fn get<E: Entity>(&self, id: i64) -> Result<Managed<E>> {
        self.find::<E>(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("{} with id {}", E::meta().name, id)))
    }

    /// Stages a delete; an entity that was never inserted is simply dropped
    /// at the next flush.
    pub fn remove<E: Entity>(&self, handle: &Managed<E>) -> Result<()> {
        self.ensure_managed(handle)?;
        handle.erased().mark_removed();
        Ok(())
    }

    /// Whether `handle` belongs to this session's identity map.
    pub fn contains<E: Entity>(&self, handle: &Managed<E>) -> bool {
        self.ensure_managed(handle).is_ok()
    }

    fn ensure_managed<E: Entity>(&self, handle: &Managed<E>) -> Result<()> {
        let map = self.map()?;
        let owned = match handle.id() {
            Some(id) => map
                .get(E::meta().name, id)
                .is_some_and(|cell| cell.seq() == handle.seq()),
            None => map.contains(handle.seq()),
        };
        if !owned || handle.state() == EntityState::Detached {
            return Err(DbError::Validation(format!(
                "{} is not managed by this session",
                handle.erased().label()
            )));
        }
        Ok(())
    }

    /// Number of managed instances.
    pub fn managed_count(&self) -> usize {
        self.map().map(|map| map.len()).unwrap_or(0)
    }

    /// Detaches every instance without writing anything. Later reads go to
    /// the store again.
    pub fn clear(&self) -> Result<()> {
        let mut map = self.map()?;
        let detached = map.len();
        map.clear();
        tracing::debug!(session = %self.ctx.owner, detached, "session cleared");
        Ok(())
    }

    /// Flushes, then ends the unit of work. Row locks are released even when
    /// the flush fails.
    pub async fn commit(self) -> Result<usize> {
        let flushed = self.flush().await;
        let released = self.release_locks().await;
        let written = flushed?;
        released?;
        Ok(written)
    }

    /// Ends the unit of work without writing pending changes.
    pub async fn close(self) -> Result<()> {
        self.release_locks().await.map(|_| ())
    }

    async fn release_locks(&self) -> Result<usize> {
        if !self.holds_locks.swap(false, Ordering::SeqCst) {
            return Ok(0);
        }
        let released = self.store.release_locks(self.ctx.owner).await?;
        tracing::debug!(session = %self.ctx.owner, released, "row locks released");
        Ok(released)
    }

    pub(crate) fn resolve(
        &self,
        meta: &'static EntityMeta,
        record: &Record,
        read_only: bool,
    ) -> Result<Arc<dyn ManagedEntity>> {
        let binding = self.registry.binding(meta.name)?;
        self.map()?.resolve(binding, record, read_only)
    }

    pub(crate) async fn query(&self, select: &Select) -> Result<QueryResult> {
        if select.lock.is_some() {
            self.holds_locks.store(true, Ordering::SeqCst);
        }
        self.store.query(&self.ctx, select).await
    }

    pub(crate) async fn execute(&self, statement: &Statement) -> Result<ExecOutcome> {
        self.store.execute(&self.ctx, statement).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.holds_locks.swap(false, Ordering::SeqCst) {
            return;
        }
        let owner = self.ctx.owner;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(err) = store.release_locks(owner).await {
                        log::warn!("failed to release row locks of session {}: {}", owner, err);
                    }
                });
            }
            Err(_) => log::warn!(
                "session {} dropped outside a runtime; its row locks expire with their lease",
                owner
            ),
        }
    }
}
