use std::sync::Arc;

use super::identity::EntityKey;
use super::managed::many_to_one;
use super::{EntityState, Managed, ManagedEntity, ROOT, Session};
use crate::core::{DbError, Result, Value};
use crate::mapping::{Entity, RelationKind};
use crate::statement::{ColumnRef, Condition, Direction, Operand, OrderBy, Select, SelectItem, TableRef};

impl Session {
    /// Follows a many-to-one relation. Served from the identity map when the
    /// target is managed, otherwise one read against the store.
    pub async fn reference<E: Entity, T: Entity>(
        &self,
        owner: &Managed<E>,
        relation: &str,
    ) -> Result<Option<Managed<T>>> {
        let fk_field = many_to_one::<E, T>(relation)?;
        if let Some(target) = owner.pending_target(fk_field) {
            return Managed::downcast(target).map(Some);
        }
        let column = E::meta()
            .column_for(fk_field)
            .ok_or_else(|| crate::mapping::unknown_field(E::meta(), fk_field))?;
        match owner.column_value(column) {
            Value::Integer(id) => self.find::<T>(id).await,
            _ => Ok(None),
        }
    }

    /// Loads the derived side of a one-to-many relation: the `T`s whose
    /// many-to-one points back at `owner`. Cached until the session is
    /// cleared; adding to the returned vector persists nothing.
    pub async fn collection<E: Entity, T: Entity>(
        &self,
        owner: &Managed<E>,
        relation: &str,
    ) -> Result<Vec<Managed<T>>> {
        let meta = E::meta();
        let target = T::meta();
        let relation = meta
            .relation(relation)
            .filter(|candidate| candidate.target == target.name)
            .ok_or_else(|| {
                DbError::Validation(format!(
                    "{} has no collection '{}' of {}",
                    meta.name, relation, target.name
                ))
            })?;
        let RelationKind::OneToMany { mapped_by } = relation.kind else {
            return Err(DbError::Validation(format!(
                "{}.{} is not a collection",
                meta.name, relation.name
            )));
        };
        let Some(owner_id) = owner.id() else {
            return Ok(Vec::new());
        };
        let key = EntityKey {
            entity: meta.name,
            id: owner_id,
        };

        let cached = self.map()?.collection(key, relation.name);
        if let Some(cells) = cached {
            return cells
                .into_iter()
                .filter(|cell| cell.state() != EntityState::Removed)
                .map(Managed::downcast)
                .collect();
        }

        let fk_field = many_to_one::<T, E>(mapped_by)?;
        let fk_column = target
            .column_for(fk_field)
            .ok_or_else(|| crate::mapping::unknown_field(target, fk_field))?;

        self.auto_flush().await?;
        let mut select = Select::from(TableRef::new(target.table, ROOT));
        select.items = vec![SelectItem::AllColumns(ROOT.to_string())];
        select.filter = Some(Condition::eq(
            Operand::Column(ColumnRef::new(ROOT, fk_column)),
            Operand::Value(Value::Integer(owner_id)),
        ));
        select.order_by = vec![OrderBy {
            column: ColumnRef::new(ROOT, target.id_column),
            direction: Direction::Asc,
        }];
        let result = self.query(&select).await?;

        let mut cells = Vec::with_capacity(result.row_count());
        for row in result.rows() {
            let record = result.record_for(row, ROOT);
            let cell = self.resolve(target, &record, false)?;
            if cell.state() != EntityState::Removed {
                cells.push(cell);
            }
        }
        self.map()?
            .cache_collection(key, relation.name, cells.clone());
        cells.into_iter().map(Managed::downcast).collect()
    }

    /// Stores the targets of a collection fetch join, so `collection` is
    /// served without another query.
    pub(crate) fn cache_fetched_collection(
        &self,
        owner: &Arc<dyn ManagedEntity>,
        relation: &'static str,
        members: Vec<Arc<dyn ManagedEntity>>,
    ) -> Result<()> {
        let Some(id) = owner.current_id() else {
            return Ok(());
        };
        let key = EntityKey {
            entity: owner.meta().name,
            id,
        };
        self.map()?.cache_collection(key, relation, members);
        Ok(())
    }
}
