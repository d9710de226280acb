use crate::core::{DbError, Result};
use crate::mapping::{EntityMeta, EntityRegistry, RelationKind, RelationMeta};
use crate::statement::{
    Bind, ColumnRef, Join, JoinKind, OrderBy, Param, Select, SelectItem, Statement, TableRef,
};

use super::page::Sort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// `SELECT ... FOR UPDATE`: exclusive row locks until the session ends.
    PessimisticWrite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryHints {
    /// Results are exempt from dirty tracking.
    pub read_only: bool,
    pub lock: Option<LockMode>,
}

/// What a select hands back per row.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// The root entity, plus any fetch-joined relations.
    Entity,
    /// Selected columns, built into view objects.
    Columns(Vec<ColumnRef>),
    Count,
}

/// A relation loaded by the same select as its owner.
#[derive(Debug, Clone)]
pub struct FetchJoin {
    pub alias: String,
    pub owner_alias: String,
    pub relation: &'static RelationMeta,
    pub target: &'static EntityMeta,
}

/// A validated, parameterised select over one root entity.
#[derive(Debug, Clone)]
pub struct SelectDescriptor {
    /// Method name or query text, for messages.
    pub name: String,
    pub root: &'static EntityMeta,
    pub alias: String,
    pub select: Select,
    pub projection: Projection,
    pub fetches: Vec<FetchJoin>,
    pub hints: QueryHints,
    aliases: Vec<(String, &'static EntityMeta)>,
}

impl SelectDescriptor {
    pub fn new(name: impl Into<String>, root: &'static EntityMeta, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            name: name.into(),
            root,
            select: Select::from(TableRef::new(root.table, alias.clone())),
            aliases: vec![(alias.clone(), root)],
            alias,
            projection: Projection::Entity,
            fetches: Vec::new(),
            hints: QueryHints::default(),
        }
    }

    pub fn entity_for(&self, alias: &str) -> Option<&'static EntityMeta> {
        self.aliases
            .iter()
            .find(|(candidate, _)| candidate == alias)
            .map(|(_, meta)| *meta)
    }

    /// `alias.field` as a store column.
    pub fn column(&self, alias: &str, field: &str) -> Result<ColumnRef> {
        let meta = self.entity_for(alias).ok_or_else(|| {
            DbError::Validation(format!("'{}': unknown alias '{}'", self.name, alias))
        })?;
        let column = meta.column_for(field).ok_or_else(|| {
            DbError::Validation(format!(
                "'{}': {} has no field '{}'",
                self.name, meta.name, field
            ))
        })?;
        Ok(ColumnRef::new(alias, column))
    }

    /// Joins `owner_alias.relation` as `alias`; a fetch join also loads the
    /// target entities into the session.
    pub fn join(
        &mut self,
        registry: &EntityRegistry,
        owner_alias: &str,
        relation: &str,
        alias: &str,
        kind: JoinKind,
        fetch: bool,
    ) -> Result<()> {
        let owner = self.entity_for(owner_alias).ok_or_else(|| {
            DbError::Validation(format!("'{}': unknown alias '{}'", self.name, owner_alias))
        })?;
        let relation = owner.relation(relation).ok_or_else(|| {
            DbError::Validation(format!(
                "'{}': {} has no relation '{}'",
                self.name, owner.name, relation
            ))
        })?;
        if self.entity_for(alias).is_some() {
            return Err(DbError::Validation(format!(
                "'{}': alias '{}' is used twice",
                self.name, alias
            )));
        }
        let target = self.target_of(registry, relation)?;

        if fetch
            && relation.is_collection()
            && let Some(existing) = self.fetches.iter().find(|f| f.relation.is_collection())
        {
            return Err(DbError::Validation(format!(
                "'{}': cannot fetch both {} and {}; joining two collections multiplies rows",
                self.name, existing.relation.name, relation.name
            )));
        }

        let (left, right) = match relation.kind {
            RelationKind::ManyToOne { fk_field } => {
                let fk = owner.column_for(fk_field).ok_or_else(|| {
                    DbError::Validation(format!(
                        "'{}': {} has no field '{}'",
                        self.name, owner.name, fk_field
                    ))
                })?;
                (
                    ColumnRef::new(owner_alias, fk),
                    ColumnRef::new(alias, target.id_column),
                )
            }
            RelationKind::OneToMany { mapped_by } => {
                let fk = match target.relation(mapped_by).map(|r| r.kind) {
                    Some(RelationKind::ManyToOne { fk_field }) => target.column_for(fk_field),
                    _ => None,
                }
                .ok_or_else(|| {
                    DbError::Validation(format!(
                        "'{}': {}.{} has no owning side",
                        self.name, owner.name, relation.name
                    ))
                })?;
                (
                    ColumnRef::new(owner_alias, owner.id_column),
                    ColumnRef::new(alias, fk),
                )
            }
        };

        self.select.joins.push(Join {
            kind,
            table: TableRef::new(target.table, alias),
            left,
            right,
        });
        self.aliases.push((alias.to_string(), target));
        if fetch {
            self.fetches.push(FetchJoin {
                alias: alias.to_string(),
                owner_alias: owner_alias.to_string(),
                relation,
                target,
            });
        }
        Ok(())
    }

    fn target_of(
        &self,
        registry: &EntityRegistry,
        relation: &RelationMeta,
    ) -> Result<&'static EntityMeta> {
        registry.meta(relation.target).map_err(|_| {
            DbError::Validation(format!(
                "'{}': relation {} targets unregistered entity {}",
                self.name, relation.name, relation.target
            ))
        })
    }

    /// Adds a LEFT fetch join for each root relation in `paths` that is not
    /// fetched yet.
    pub fn apply_graph(&mut self, registry: &EntityRegistry, paths: &[&str]) -> Result<()> {
        let root_alias = self.alias.clone();
        for path in paths {
            if path.contains('.') {
                return Err(DbError::Validation(format!(
                    "'{}': nested graph path '{}' is not supported",
                    self.name, path
                )));
            }
            let already = self
                .fetches
                .iter()
                .any(|fetch| fetch.owner_alias == root_alias && fetch.relation.name == *path);
            if already {
                continue;
            }
            let alias = format!("{}_{}", root_alias, path);
            self.join(registry, &root_alias, path, &alias, JoinKind::Left, true)?;
        }
        Ok(())
    }

    pub fn has_collection_fetch(&self) -> bool {
        self.fetches.iter().any(|fetch| fetch.relation.is_collection())
    }

    /// Fixes the select list for the projection; call once the joins are
    /// final.
    pub fn finish(&mut self) -> Result<()> {
        self.select.items = match &self.projection {
            Projection::Entity => std::iter::once(self.alias.clone())
                .chain(self.fetches.iter().map(|fetch| fetch.alias.clone()))
                .map(SelectItem::AllColumns)
                .collect(),
            Projection::Columns(columns) => {
                if !self.fetches.is_empty() {
                    return Err(DbError::Validation(format!(
                        "'{}': fetch joins need the owning entity in the select list",
                        self.name
                    )));
                }
                columns.iter().cloned().map(SelectItem::Column).collect()
            }
            Projection::Count => vec![SelectItem::CountAll],
        };
        Ok(())
    }

    /// The same filter over the same rows, counted; fetch joins dropped.
    pub fn count_select(&self) -> Select {
        let mut count = self.select.to_count();
        count
            .joins
            .retain(|join| !self.fetches.iter().any(|fetch| fetch.alias == join.table.alias));
        count
    }

    /// ORDER BY terms for a sort over root fields.
    pub fn order_for(&self, sort: &Sort) -> Result<Vec<OrderBy>> {
        sort.orders
            .iter()
            .map(|order| {
                Ok(OrderBy {
                    column: self.column(&self.alias, &order.property)?,
                    direction: order.direction,
                })
            })
            .collect()
    }

    /// Placeholders in first-use order.
    pub fn params(&self) -> Vec<Param> {
        let mut params = Vec::new();
        self.select.collect_params(&mut params);
        params
    }
}

/// A bulk UPDATE or DELETE; bypasses the identity map.
#[derive(Debug, Clone)]
pub struct BulkDescriptor {
    pub name: String,
    pub root: &'static EntityMeta,
    pub statement: Statement,
}

impl BulkDescriptor {
    pub fn params(&self) -> Vec<Param> {
        let mut params = Vec::new();
        self.statement.collect_params(&mut params);
        params
    }
}

#[derive(Debug, Clone)]
pub enum QueryDescriptor {
    Select(SelectDescriptor),
    Bulk(BulkDescriptor),
}
