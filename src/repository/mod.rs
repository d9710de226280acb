//! Per-entity repositories.
//!
//! A [`Repository`] owns the CRUD operations every entity gets and is the
//! factory for its declared queries. It holds no session: each call takes
//! the unit of work it runs in.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::PagingConfig;
use crate::core::Result;
use crate::mapping::{Entity, EntityRegistry};
use crate::query::{CountQuery, EntityQuery, Many, Page, PageRequest, PagedQuery, QueryBuilder};
use crate::session::{Managed, Session};
use crate::statement::Params;

pub struct Repository<E: Entity> {
    registry: Arc<EntityRegistry>,
    paging: PagingConfig,
    all: EntityQuery<E, Many>,
    all_paged: PagedQuery<E>,
    count_all: CountQuery,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            paging: self.paging.clone(),
            all: self.all.clone(),
            all_paged: self.all_paged.clone(),
            count_all: self.count_all.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E: Entity> Repository<E> {
    /// Fails with `Validation` when `E` is not registered.
    pub fn new(registry: Arc<EntityRegistry>, paging: PagingConfig) -> Result<Self> {
        registry.meta(E::meta().name)?;
        let all = QueryBuilder::<E>::method(Arc::clone(&registry), paging.clone(), "findAll");
        let all_paged = QueryBuilder::<E>::method(Arc::clone(&registry), paging.clone(), "findAll");
        let count_all = QueryBuilder::<E>::method(Arc::clone(&registry), paging.clone(), "countAll");
        Ok(Self {
            all: all.build()?,
            all_paged: all_paged.paged()?,
            count_all: count_all.count()?,
            registry,
            paging,
            _marker: PhantomData,
        })
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn paging(&self) -> &PagingConfig {
        &self.paging
    }

    /// A query derived from a method name such as
    /// `findByUsernameAndAgeGreaterThan`.
    pub fn method(&self, name: &str) -> QueryBuilder<E> {
        QueryBuilder::method(Arc::clone(&self.registry), self.paging.clone(), name)
    }

    /// A query written in the entity query language.
    pub fn jpql(&self, text: &str) -> QueryBuilder<E> {
        QueryBuilder::jpql(Arc::clone(&self.registry), self.paging.clone(), text)
    }

    pub async fn save(&self, session: &Session, entity: E) -> Result<Managed<E>> {
        session.save(entity).await
    }

    pub async fn find_by_id(&self, session: &Session, id: i64) -> Result<Option<Managed<E>>> {
        session.find::<E>(id).await
    }

    /// Fails with `NotFound` when no row has this key.
    pub async fn get_by_id(&self, session: &Session, id: i64) -> Result<Managed<E>> {
        session.get::<E>(id).await
    }

    pub async fn find_all(&self, session: &Session) -> Result<Vec<Managed<E>>> {
        self.all.fetch(session, Params::new()).await
    }

    pub async fn find_all_paged(
        &self,
        session: &Session,
        request: &PageRequest,
    ) -> Result<Page<Managed<E>>> {
        self.all_paged.fetch(session, Params::new(), request).await
    }

    pub async fn count(&self, session: &Session) -> Result<u64> {
        self.count_all.fetch(session, Params::new()).await
    }

    pub fn delete(&self, session: &Session, handle: &Managed<E>) -> Result<()> {
        session.remove(handle)
    }

    /// Loads and removes; `false` when no row has this key.
    pub async fn delete_by_id(&self, session: &Session, id: i64) -> Result<bool> {
        match session.find::<E>(id).await? {
            Some(handle) => {
                session.remove(&handle)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
