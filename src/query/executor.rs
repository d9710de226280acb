//! Runs descriptors against a session's store.
//!
//! Entity rows are resolved through the identity map, so a query never
//! replaces an instance the session already manages. View rows and counts
//! bypass the map entirely, as do bulk statements.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::PagingConfig;
use crate::core::{DbError, Result, Row, Value};
use crate::session::{EntityState, ManagedEntity, Session};
use crate::statement::{Bind, Direction, OrderBy, Params, RowLock, Select};

use super::descriptor::{BulkDescriptor, LockMode, SelectDescriptor};
use super::page::PageRequest;

/// Offset and limit of one page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    pub offset: usize,
    pub limit: usize,
}

fn bound_select(descriptor: &SelectDescriptor, params: &Params) -> Result<Select> {
    let mut select = descriptor.select.bind(params)?;
    if descriptor.hints.lock == Some(LockMode::PessimisticWrite) {
        select.lock = Some(RowLock::ForUpdate);
    }
    Ok(select)
}

/// Loads root entities, and any fetch-joined relations, into the session.
/// Roots come back once each, in row order.
pub(crate) async fn load_entities(
    session: &Session,
    descriptor: &SelectDescriptor,
    params: &Params,
    order: Option<Vec<OrderBy>>,
    window: Option<Window>,
) -> Result<Vec<Arc<dyn ManagedEntity>>> {
    session.auto_flush().await?;

    let mut select = bound_select(descriptor, params)?;
    if let Some(order) = order {
        select.order_by = order;
    }
    if let Some(window) = window {
        select.offset = Some(window.offset);
        select.limit = Some(window.limit);
    }
    let result = session.query(&select).await?;
    let read_only = descriptor.hints.read_only;

    let mut roots = Vec::new();
    let mut seen = HashSet::new();
    // (owner seq, relation) -> (owner, members)
    let mut collections: HashMap<(u64, &'static str), (Arc<dyn ManagedEntity>, Vec<Arc<dyn ManagedEntity>>)> =
        HashMap::new();

    for row in result.rows() {
        let record = result.record_for(row, &descriptor.alias);
        let root = session.resolve(descriptor.root, &record, read_only)?;
        // Staged deletes are gone for this session even before the flush.
        if root.state() == EntityState::Removed {
            continue;
        }
        if seen.insert(root.seq()) {
            roots.push(Arc::clone(&root));
        }
        if descriptor.fetches.is_empty() {
            continue;
        }

        let mut by_alias: HashMap<&str, Arc<dyn ManagedEntity>> = HashMap::new();
        by_alias.insert(descriptor.alias.as_str(), root);
        for fetch in &descriptor.fetches {
            let record = result.record_for(row, &fetch.alias);
            let joined = match record.get(fetch.target.id_column) {
                Some(Value::Integer(_)) => Some(session.resolve(fetch.target, &record, read_only)?),
                _ => None,
            };
            if fetch.relation.is_collection()
                && let Some(owner) = by_alias.get(fetch.owner_alias.as_str())
            {
                let (_, members) = collections
                    .entry((owner.seq(), fetch.relation.name))
                    .or_insert_with(|| (Arc::clone(owner), Vec::new()));
                if let Some(member) = &joined
                    && member.state() != EntityState::Removed
                    && !members.iter().any(|m| m.seq() == member.seq())
                {
                    members.push(Arc::clone(member));
                }
            }
            if let Some(joined) = joined {
                by_alias.insert(fetch.alias.as_str(), joined);
            }
        }
    }

    for ((_, relation), (owner, members)) in collections {
        session.cache_fetched_collection(&owner, relation, members)?;
    }
    tracing::debug!(
        query = %descriptor.name,
        rows = result.row_count(),
        entities = roots.len(),
        "entities loaded"
    );
    Ok(roots)
}

/// Rows of a column projection, in select-list order.
pub(crate) async fn load_rows(
    session: &Session,
    descriptor: &SelectDescriptor,
    params: &Params,
) -> Result<Vec<Row>> {
    session.auto_flush().await?;
    let select = bound_select(descriptor, params)?;
    let result = session.query(&select).await?;
    Ok(result.rows)
}

/// Rows matched by the descriptor's filter, fetch joins ignored.
pub(crate) async fn count(
    session: &Session,
    descriptor: &SelectDescriptor,
    params: &Params,
) -> Result<u64> {
    session.auto_flush().await?;
    let select = descriptor.count_select().bind(params)?;
    let total = session.query(&select).await?.scalar_i64()?;
    u64::try_from(total)
        .map_err(|_| DbError::ExecutionError(format!("negative count {} from '{}'", total, descriptor.name)))
}

/// Resolves the effective order and window of a page request: the size is
/// clamped to the configured maximum; the request's sort wins over the
/// query's own order, which wins over the configured default; the root key
/// breaks ties so windows never overlap.
pub(crate) fn plan_page(
    descriptor: &SelectDescriptor,
    paging: &PagingConfig,
    request: &PageRequest,
) -> Result<(Vec<OrderBy>, Window)> {
    if request.size() == 0 {
        return Err(DbError::Validation(format!(
            "'{}': page size must be at least 1",
            descriptor.name
        )));
    }
    let size = request.size().min(paging.max_page_size);

    let mut order = if !request.sort().is_unsorted() {
        descriptor.order_for(request.sort())?
    } else if !descriptor.select.order_by.is_empty() {
        descriptor.select.order_by.clone()
    } else {
        match &paging.default_sort {
            Some(sort) => descriptor.order_for(sort).unwrap_or_else(|_| {
                tracing::debug!(
                    query = %descriptor.name,
                    entity = descriptor.root.name,
                    "default sort does not apply to this entity"
                );
                Vec::new()
            }),
            None => Vec::new(),
        }
    };

    let key = descriptor.column(&descriptor.alias, descriptor.root.id_field)?;
    if !order.iter().any(|term| term.column == key) {
        order.push(OrderBy {
            column: key,
            direction: Direction::Asc,
        });
    }

    let window = Window {
        offset: request.page().saturating_mul(size),
        limit: size,
    };
    Ok((order, window))
}

/// Options of a bulk statement, mirroring what callers may ask for around
/// a statement that bypasses the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOptions {
    /// Flush pending changes first, whatever the flush mode.
    pub flush_automatically: bool,
    /// Clear the session afterwards so later reads see the new values.
    pub clear_automatically: bool,
}

pub(crate) async fn execute_bulk(
    session: &Session,
    descriptor: &BulkDescriptor,
    params: &Params,
    options: BulkOptions,
) -> Result<u64> {
    if options.flush_automatically {
        session.flush().await?;
    } else {
        session.auto_flush().await?;
    }
    let statement = descriptor.statement.bind(params)?;
    let outcome = session.execute(&statement).await?;
    tracing::debug!(query = %descriptor.name, affected = outcome.affected, "bulk statement");
    if options.clear_automatically {
        session.clear()?;
    }
    Ok(outcome.affected)
}
