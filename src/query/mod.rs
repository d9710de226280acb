//! Query handles built once at startup and run against any session.
//!
//! A handle is created from a derived method name or literal query text
//! through [`QueryBuilder`]; all validation happens in the `build*` calls.
//! The result shape is part of the handle's type:
//!
//! | handle | output |
//! |---|---|
//! | `EntityQuery<E, Many>` | `Vec<Managed<E>>` |
//! | `EntityQuery<E, Optional>` | `Option<Managed<E>>` |
//! | `EntityQuery<E, One>` | `Managed<E>` |
//! | `PagedQuery<E>` | `Page<Managed<E>>` |
//! | `ViewQuery<V, S>` | views built with [`FromRow`] |
//! | `CountQuery` | `u64` |
//! | `BulkUpdate` | affected rows |

pub mod derive;
mod descriptor;
mod executor;
pub mod jpql;
mod page;
mod projection;

pub use descriptor::{
    BulkDescriptor, FetchJoin, LockMode, Projection, QueryDescriptor, QueryHints,
    SelectDescriptor,
};
pub use executor::BulkOptions;
pub use page::{Direction, Order, Page, PageRequest, Sort};
pub use projection::FromRow;

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::PagingConfig;
use crate::core::{DbError, Result};
use crate::mapping::{Entity, EntityRegistry};
use crate::session::{Managed, Session};
use crate::statement::Params;

use executor::Window;

/// How many results a query hands back.
pub trait Shape: Send + Sync + 'static {
    type Output<T>;

    fn shape<T>(query: &str, items: Vec<T>) -> Result<Self::Output<T>>;
}

/// Zero or more results.
pub struct Many;

/// At most one result; absence is `None`.
pub struct Optional;

/// Exactly one result; absence is `NotFound`.
pub struct One;

impl Shape for Many {
    type Output<T> = Vec<T>;

    fn shape<T>(_query: &str, items: Vec<T>) -> Result<Vec<T>> {
        Ok(items)
    }
}

impl Shape for Optional {
    type Output<T> = Option<T>;

    fn shape<T>(query: &str, mut items: Vec<T>) -> Result<Option<T>> {
        match items.len() {
            0 => Ok(None),
            1 => Ok(items.pop()),
            count => Err(DbError::AmbiguousResult {
                query: query.to_string(),
                count,
            }),
        }
    }
}

impl Shape for One {
    type Output<T> = T;

    fn shape<T>(query: &str, items: Vec<T>) -> Result<T> {
        Optional::shape(query, items)?
            .ok_or_else(|| DbError::NotFound(format!("no result for '{}'", query)))
    }
}

fn typed<E: Entity>(cells: Vec<Arc<dyn crate::session::ManagedEntity>>) -> Result<Vec<Managed<E>>> {
    cells.into_iter().map(Managed::downcast).collect()
}

/// Loads managed entities.
pub struct EntityQuery<E, S> {
    descriptor: Arc<SelectDescriptor>,
    _marker: PhantomData<fn() -> (E, S)>,
}

impl<E, S> Clone for EntityQuery<E, S> {
    fn clone(&self) -> Self {
        Self {
            descriptor: Arc::clone(&self.descriptor),
            _marker: PhantomData,
        }
    }
}

impl<E: Entity, S: Shape> EntityQuery<E, S> {
    pub fn descriptor(&self) -> &SelectDescriptor {
        &self.descriptor
    }

    pub async fn fetch(
        &self,
        session: &Session,
        params: impl Into<Params>,
    ) -> Result<S::Output<Managed<E>>> {
        let params = params.into();
        let cells = executor::load_entities(session, &self.descriptor, &params, None, None).await?;
        S::shape(&self.descriptor.name, typed(cells)?)
    }
}

/// Loads one page of managed entities: a windowed select plus a count over
/// the same filter.
pub struct PagedQuery<E> {
    descriptor: Arc<SelectDescriptor>,
    paging: PagingConfig,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for PagedQuery<E> {
    fn clone(&self) -> Self {
        Self {
            descriptor: Arc::clone(&self.descriptor),
            paging: self.paging.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E: Entity> PagedQuery<E> {
    pub fn descriptor(&self) -> &SelectDescriptor {
        &self.descriptor
    }

    pub async fn fetch(
        &self,
        session: &Session,
        params: impl Into<Params>,
        request: &PageRequest,
    ) -> Result<Page<Managed<E>>> {
        let params = params.into();
        let (order, window) = executor::plan_page(&self.descriptor, &self.paging, request)?;
        let Window { limit, .. } = window;

        let cells =
            executor::load_entities(session, &self.descriptor, &params, Some(order), Some(window))
                .await?;
        let total = executor::count(session, &self.descriptor, &params).await?;
        Ok(Page::new(typed(cells)?, request.page(), limit, total))
    }

    /// The first page with the configured size and sort.
    pub fn first_page(&self) -> PageRequest {
        self.paging.request(0)
    }
}

/// Builds views straight from selected columns; nothing is managed.
pub struct ViewQuery<V, S> {
    descriptor: Arc<SelectDescriptor>,
    _marker: PhantomData<fn() -> (V, S)>,
}

impl<V, S> Clone for ViewQuery<V, S> {
    fn clone(&self) -> Self {
        Self {
            descriptor: Arc::clone(&self.descriptor),
            _marker: PhantomData,
        }
    }
}

impl<V: FromRow, S: Shape> ViewQuery<V, S> {
    pub fn descriptor(&self) -> &SelectDescriptor {
        &self.descriptor
    }

    pub async fn fetch(&self, session: &Session, params: impl Into<Params>) -> Result<S::Output<V>> {
        let params = params.into();
        let rows = executor::load_rows(session, &self.descriptor, &params).await?;
        let views = rows
            .iter()
            .map(|row| V::from_row(row))
            .collect::<Result<Vec<_>>>()?;
        S::shape(&self.descriptor.name, views)
    }
}

#[derive(Clone)]
pub struct CountQuery {
    descriptor: Arc<SelectDescriptor>,
}

impl CountQuery {
    pub fn descriptor(&self) -> &SelectDescriptor {
        &self.descriptor
    }

    pub async fn fetch(&self, session: &Session, params: impl Into<Params>) -> Result<u64> {
        executor::count(session, &self.descriptor, &params.into()).await
    }
}

/// A single UPDATE or DELETE over every matching row. The session's
/// managed instances are left untouched: unless `clear_automatically` is
/// set, they keep the values they had before the statement.
#[derive(Clone)]
pub struct BulkUpdate {
    descriptor: Arc<BulkDescriptor>,
    options: BulkOptions,
}

impl BulkUpdate {
    pub fn descriptor(&self) -> &BulkDescriptor {
        &self.descriptor
    }

    pub fn clear_automatically(mut self) -> Self {
        self.options.clear_automatically = true;
        self
    }

    pub fn flush_automatically(mut self) -> Self {
        self.options.flush_automatically = true;
        self
    }

    pub fn options(&self) -> BulkOptions {
        self.options
    }

    pub async fn execute(&self, session: &Session, params: impl Into<Params>) -> Result<u64> {
        executor::execute_bulk(session, &self.descriptor, &params.into(), self.options).await
    }
}

#[derive(Debug, Clone)]
enum Source {
    Method(String),
    Text(String),
}

#[derive(Debug, Clone)]
enum Graph {
    Paths(&'static [&'static str]),
    Named(String),
}

/// Collects a query's source and hints; every `build*` call parses and
/// validates, so mistakes surface while repositories are assembled.
pub struct QueryBuilder<E> {
    registry: Arc<EntityRegistry>,
    paging: PagingConfig,
    source: Source,
    hints: QueryHints,
    graph: Option<Graph>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Entity> QueryBuilder<E> {
    fn new(registry: Arc<EntityRegistry>, paging: PagingConfig, source: Source) -> Self {
        Self {
            registry,
            paging,
            source,
            hints: QueryHints::default(),
            graph: None,
            _marker: PhantomData,
        }
    }

    pub fn method(registry: Arc<EntityRegistry>, paging: PagingConfig, name: &str) -> Self {
        Self::new(registry, paging, Source::Method(name.to_string()))
    }

    pub fn jpql(registry: Arc<EntityRegistry>, paging: PagingConfig, text: &str) -> Self {
        Self::new(registry, paging, Source::Text(text.to_string()))
    }

    /// Loaded entities are not dirty-checked; changes to them are never
    /// written.
    pub fn read_only(mut self) -> Self {
        self.hints.read_only = true;
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.hints.lock = Some(mode);
        self
    }

    /// Fetches these root relations in the same select.
    pub fn graph(mut self, paths: &'static [&'static str]) -> Self {
        self.graph = Some(Graph::Paths(paths));
        self
    }

    /// Fetches the relations of a graph declared on the entity.
    pub fn named_graph(mut self, name: &str) -> Self {
        self.graph = Some(Graph::Named(name.to_string()));
        self
    }

    fn name(&self) -> &str {
        match &self.source {
            Source::Method(name) | Source::Text(name) => name,
        }
    }

    fn parse(&self) -> Result<QueryDescriptor> {
        let meta = self.registry.meta(E::meta().name)?;
        let descriptor = match &self.source {
            Source::Method(name) => QueryDescriptor::Select(derive::derive(meta, name)?),
            Source::Text(text) => jpql::parse(&self.registry, text)?,
        };
        let root = match &descriptor {
            QueryDescriptor::Select(select) => select.root,
            QueryDescriptor::Bulk(bulk) => bulk.root,
        };
        if root.name != meta.name {
            return Err(DbError::Validation(format!(
                "'{}' queries {}, not {}",
                self.name(),
                root.name,
                meta.name
            )));
        }
        Ok(descriptor)
    }

    fn select(&self) -> Result<SelectDescriptor> {
        match self.parse()? {
            QueryDescriptor::Select(select) => Ok(select),
            QueryDescriptor::Bulk(_) => Err(DbError::Validation(format!(
                "'{}' is a bulk statement; build it with modifying()",
                self.name()
            ))),
        }
    }

    fn entity_select(&self) -> Result<SelectDescriptor> {
        let mut select = self.select()?;
        if select.projection != Projection::Entity {
            return Err(DbError::Validation(format!(
                "'{}' does not select {} entities",
                self.name(),
                E::meta().name
            )));
        }
        match &self.graph {
            Some(Graph::Paths(paths)) => select.apply_graph(&self.registry, paths)?,
            Some(Graph::Named(name)) => {
                let graph = E::meta().graph(name).ok_or_else(|| {
                    DbError::Validation(format!(
                        "'{}': {} declares no graph '{}'",
                        self.name(),
                        E::meta().name,
                        name
                    ))
                })?;
                select.apply_graph(&self.registry, graph.paths)?;
            }
            None => {}
        }
        select.hints = self.hints;
        select.finish()?;
        Ok(select)
    }

    fn plain_select(&self, what: &str) -> Result<SelectDescriptor> {
        if self.graph.is_some() || self.hints != QueryHints::default() {
            return Err(DbError::Validation(format!(
                "'{}': fetch graphs, locks and read-only apply to entity queries, not {}",
                self.name(),
                what
            )));
        }
        self.select()
    }

    pub fn build<S: Shape>(self) -> Result<EntityQuery<E, S>> {
        let select = self.entity_select()?;
        tracing::debug!(query = %select.name, sql = %select.select, "entity query registered");
        Ok(EntityQuery {
            descriptor: Arc::new(select),
            _marker: PhantomData,
        })
    }

    /// A paged query. Collection fetch joins are refused: the window would
    /// cut through an owner's rows.
    pub fn paged(self) -> Result<PagedQuery<E>> {
        let select = self.entity_select()?;
        if select.has_collection_fetch() {
            return Err(DbError::Validation(format!(
                "'{}': paging cannot be combined with a collection fetch join",
                select.name
            )));
        }
        tracing::debug!(query = %select.name, sql = %select.select, "paged query registered");
        Ok(PagedQuery {
            descriptor: Arc::new(select),
            paging: self.paging,
            _marker: PhantomData,
        })
    }

    pub fn project<V: FromRow, S: Shape>(self) -> Result<ViewQuery<V, S>> {
        let select = self.plain_select("projections")?;
        let width = match &select.projection {
            Projection::Columns(columns) => columns.len(),
            _ => {
                return Err(DbError::Validation(format!(
                    "'{}' does not select columns",
                    select.name
                )));
            }
        };
        if width != V::ARITY {
            return Err(DbError::Validation(format!(
                "'{}' selects {} column(s) but the view takes {}",
                select.name,
                width,
                V::ARITY
            )));
        }
        tracing::debug!(query = %select.name, sql = %select.select, "view query registered");
        Ok(ViewQuery {
            descriptor: Arc::new(select),
            _marker: PhantomData,
        })
    }

    pub fn count(self) -> Result<CountQuery> {
        let select = self.plain_select("counts")?;
        if select.projection != Projection::Count {
            return Err(DbError::Validation(format!(
                "'{}' is not a count query",
                select.name
            )));
        }
        tracing::debug!(query = %select.name, sql = %select.select, "count query registered");
        Ok(CountQuery {
            descriptor: Arc::new(select),
        })
    }

    pub fn modifying(self) -> Result<BulkUpdate> {
        if self.graph.is_some() || self.hints != QueryHints::default() {
            return Err(DbError::Validation(format!(
                "'{}': bulk statements take no fetch graph, lock or read-only hint",
                self.name()
            )));
        }
        match self.parse()? {
            QueryDescriptor::Bulk(bulk) => {
                tracing::debug!(query = %bulk.name, sql = %bulk.statement, "bulk statement registered");
                Ok(BulkUpdate {
                    descriptor: Arc::new(bulk),
                    options: BulkOptions::default(),
                })
            }
            QueryDescriptor::Select(select) => Err(DbError::Validation(format!(
                "'{}' is not an update or delete",
                select.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes() {
        assert_eq!(Many::shape("q", vec![1, 2]).unwrap(), vec![1, 2]);
        assert_eq!(Optional::shape::<i32>("q", vec![]).unwrap(), None);
        assert_eq!(One::shape("q", vec![7]).unwrap(), 7);
        assert!(matches!(
            One::shape::<i32>("q", vec![]),
            Err(DbError::NotFound(_))
        ));
        assert!(matches!(
            Optional::shape("q", vec![1, 2]),
            Err(DbError::AmbiguousResult { count: 2, .. })
        ));
    }
}
