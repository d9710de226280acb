use std::collections::HashSet;
use std::sync::Arc;

use super::{Entity, EntityMeta, RelationKind};
use crate::core::{Column, DataType, DbError, Result};
use crate::session::{Loader, load_cell};
use crate::storage::{Store, TableSchema};

pub(crate) struct Binding {
    pub meta: &'static EntityMeta,
    pub load: Loader,
}

/// The explicit registration step: every entity type a session may load is
/// registered here once, at startup, and checked as a whole.
pub struct EntityRegistry {
    entities: Vec<Binding>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
        }
    }

    pub fn register<E: Entity>(mut self) -> Self {
        self.entities.push(Binding {
            meta: E::meta(),
            load: load_cell::<E>,
        });
        self
    }

    /// Validates relations, graphs and version fields across all registered
    /// entities.
    pub fn build(self) -> Result<Arc<Self>> {
        let mut names = HashSet::new();
        for binding in &self.entities {
            if !names.insert(binding.meta.name) {
                return Err(DbError::Validation(format!(
                    "Entity '{}' is registered twice",
                    binding.meta.name
                )));
            }
        }
        for binding in &self.entities {
            self.validate(binding.meta)?;
        }
        tracing::debug!(entities = self.entities.len(), "entity registry built");
        Ok(Arc::new(self))
    }

    fn validate(&self, meta: &'static EntityMeta) -> Result<()> {
        let mut columns = HashSet::new();
        columns.insert(meta.id_column);
        for field in meta.fields {
            if field.name == meta.id_field || !columns.insert(field.column) {
                return Err(DbError::Validation(format!(
                    "{} maps column '{}' twice",
                    meta.name, field.column
                )));
            }
        }

        for relation in meta.relations {
            let target = self.meta(relation.target).map_err(|_| {
                DbError::Validation(format!(
                    "{}.{} targets unregistered entity '{}'",
                    meta.name, relation.name, relation.target
                ))
            })?;
            match relation.kind {
                RelationKind::ManyToOne { fk_field } => {
                    let field = meta.field(fk_field).ok_or_else(|| {
                        DbError::Validation(format!(
                            "{}.{} uses unknown foreign key field '{}'",
                            meta.name, relation.name, fk_field
                        ))
                    })?;
                    if field.data_type != DataType::Integer {
                        return Err(DbError::Validation(format!(
                            "Foreign key field {}.{} must be an integer",
                            meta.name, fk_field
                        )));
                    }
                }
                RelationKind::OneToMany { mapped_by } => {
                    let owner = target.relation(mapped_by);
                    let valid = matches!(
                        owner,
                        Some(owner)
                            if owner.target == meta.name
                                && matches!(owner.kind, RelationKind::ManyToOne { .. })
                    );
                    if !valid {
                        return Err(DbError::Validation(format!(
                            "{}.{} is mapped by '{}', which is not a many-to-one of {} back to {}",
                            meta.name, relation.name, mapped_by, target.name, meta.name
                        )));
                    }
                }
            }
        }

        for graph in meta.graphs {
            for path in graph.paths {
                if meta.relation(path).is_none() {
                    return Err(DbError::Validation(format!(
                        "Entity graph '{}' names unknown relation '{}'",
                        graph.name, path
                    )));
                }
            }
        }

        if let Some(version) = meta.version_field {
            let is_integer = meta
                .field(version)
                .is_some_and(|field| field.data_type == DataType::Integer);
            if !is_integer {
                return Err(DbError::Validation(format!(
                    "Version field {}.{} must be a declared integer field",
                    meta.name, version
                )));
            }
        }
        Ok(())
    }

    pub fn meta(&self, name: &str) -> Result<&'static EntityMeta> {
        self.binding(name).map(|binding| binding.meta)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.iter().any(|binding| binding.meta.name == name)
    }

    pub(crate) fn binding(&self, name: &str) -> Result<&Binding> {
        self.entities
            .iter()
            .find(|binding| binding.meta.name == name)
            .ok_or_else(|| DbError::Validation(format!("Unknown entity '{}'", name)))
    }

    pub fn entities(&self) -> impl Iterator<Item = &'static EntityMeta> + '_ {
        self.entities.iter().map(|binding| binding.meta)
    }

    pub fn table_schema(&self, meta: &EntityMeta) -> Result<TableSchema> {
        let mut columns = vec![Column::new(meta.id_column, DataType::Integer).auto_increment_key()];
        for field in meta.fields {
            let mut column = Column::new(field.column, field.data_type);
            if !field.nullable {
                column = column.not_null();
            }
            if field.unique {
                column = column.unique();
            }
            let owning = meta.relations.iter().find(|relation| {
                matches!(relation.kind, RelationKind::ManyToOne { fk_field } if fk_field == field.name)
            });
            if let Some(relation) = owning {
                let target = self.meta(relation.target)?;
                column = column.references(target.table, target.id_column);
            }
            columns.push(column);
        }
        Ok(TableSchema::new(meta.table, columns))
    }

    /// Creates one table per entity, referenced tables first.
    pub async fn install(&self, store: &dyn Store) -> Result<()> {
        let mut created: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&'static EntityMeta> = self.entities().collect();
        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|meta| {
                meta.relations.iter().all(|relation| match relation.kind {
                    RelationKind::ManyToOne { .. } => {
                        relation.target == meta.name || created.contains(relation.target)
                    }
                    RelationKind::OneToMany { .. } => true,
                })
            });
            if ready.is_empty() {
                let names: Vec<_> = blocked.iter().map(|meta| meta.name).collect();
                return Err(DbError::Validation(format!(
                    "Foreign keys form a cycle between {}",
                    names.join(", ")
                )));
            }
            for meta in ready {
                store.create_table(self.table_schema(meta)?).await?;
                created.insert(meta.name);
            }
            pending = blocked;
        }
        Ok(())
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
