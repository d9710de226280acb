// ============================================================================
// entity-session
// ============================================================================
//
// A persistence context for typed entities over a relational store:
// per-unit-of-work identity map, deferred writes, derived and literal
// queries, paging, bulk statements, fetch plans and row locks.

pub mod config;
pub mod core;
pub mod domain;
pub mod mapping;
pub mod query;
pub mod repository;
pub mod result;
pub mod session;
pub mod statement;
pub mod storage;

pub use config::{FlushMode, OrmConfig, PagingConfig, SessionConfig};
pub use core::{DataType, DbError, Record, Result, Value};
pub use mapping::{Entity, EntityMeta, EntityRegistry};
pub use query::{
    BulkOptions, BulkUpdate, CountQuery, Direction, EntityQuery, FromRow, LockMode, Many, One,
    Optional, Page, PageRequest, PagedQuery, QueryBuilder, Sort, ViewQuery,
};
pub use repository::Repository;
pub use result::QueryResult;
pub use session::{EntityState, Managed, Session};
pub use statement::Params;
pub use storage::{MemoryStore, Store};

// ============================================================================
// Wiring
// ============================================================================

use std::sync::Arc;

/// A store, its registered entities and the configuration, shared by every
/// session of a process.
///
/// ```
/// # tokio_test::block_on(async {
/// use entity_session::{OrmConfig, Persistence, domain};
///
/// let persistence = Persistence::in_memory(domain::registry()?, OrmConfig::default()).await?;
/// let session = persistence.session();
/// let team = session.save(domain::Team::new("teamA")).await?;
/// session.flush().await?;
/// assert!(team.id().is_some());
/// # Ok::<(), entity_session::DbError>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn Store>,
    registry: Arc<EntityRegistry>,
    config: OrmConfig,
}

impl Persistence {
    /// Installs the registry's tables into `store`.
    pub async fn new(
        store: Arc<dyn Store>,
        registry: Arc<EntityRegistry>,
        config: OrmConfig,
    ) -> Result<Self> {
        config.validate().map_err(DbError::Config)?;
        registry.install(store.as_ref()).await?;
        tracing::info!(
            entities = registry.entities().count(),
            flush_mode = ?config.session.flush_mode,
            "persistence ready"
        );
        Ok(Self {
            store,
            registry,
            config,
        })
    }

    pub async fn in_memory(registry: Arc<EntityRegistry>, config: OrmConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()), registry, config).await
    }

    /// Opens a new unit of work.
    pub fn session(&self) -> Session {
        Session::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config.session.clone(),
        )
    }

    /// Opens a unit of work with its own flush mode, lock timeout or auditor.
    pub fn session_with(&self, config: SessionConfig) -> Session {
        Session::new(Arc::clone(&self.store), Arc::clone(&self.registry), config)
    }

    pub fn repository<E: Entity>(&self) -> Result<Repository<E>> {
        Repository::new(Arc::clone(&self.registry), self.config.paging.clone())
    }

    pub fn member_repository(&self) -> Result<domain::MemberRepository> {
        domain::MemberRepository::new(Arc::clone(&self.registry), self.config.paging.clone())
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrmConfig {
        &self.config
    }
}
