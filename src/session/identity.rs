use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::managed::ManagedEntity;
use crate::core::{DbError, Record, Result};
use crate::mapping::registry::Binding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntityKey {
    pub entity: &'static str,
    pub id: i64,
}

/// The per-session cache: at most one cell per `(entity, key)`, iterated in
/// the order entities joined the session.
#[derive(Default)]
pub(crate) struct IdentityMap {
    next_seq: u64,
    cells: BTreeMap<u64, Arc<dyn ManagedEntity>>,
    keys: HashMap<EntityKey, u64>,
    collections: HashMap<(EntityKey, &'static str), Vec<Arc<dyn ManagedEntity>>>,
}

impl IdentityMap {
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn insert(&mut self, cell: Arc<dyn ManagedEntity>) {
        self.index(&cell);
        self.cells.insert(cell.seq(), cell);
    }

    /// Registers the cell's key, once it has one.
    pub fn index(&mut self, cell: &Arc<dyn ManagedEntity>) {
        if let Some(id) = cell.current_id() {
            let key = EntityKey {
                entity: cell.meta().name,
                id,
            };
            self.keys.insert(key, cell.seq());
        }
    }

    pub fn get(&self, entity: &'static str, id: i64) -> Option<Arc<dyn ManagedEntity>> {
        self.keys
            .get(&EntityKey { entity, id })
            .and_then(|seq| self.cells.get(seq))
            .cloned()
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.cells.contains_key(&seq)
    }

    pub fn evict(&mut self, seq: u64) {
        if self.cells.remove(&seq).is_some() {
            self.keys.retain(|_, cell_seq| *cell_seq != seq);
        }
    }

    pub fn in_order(&self) -> Vec<Arc<dyn ManagedEntity>> {
        self.cells.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Detaches and forgets every cell.
    pub fn clear(&mut self) {
        for cell in self.cells.values() {
            cell.detach();
        }
        self.cells.clear();
        self.keys.clear();
        self.collections.clear();
    }

    /// Returns the managed instance for a freshly read row. An instance
    /// already in the map wins; the row is discarded.
    pub fn resolve(
        &mut self,
        binding: &Binding,
        record: &Record,
        read_only: bool,
    ) -> Result<Arc<dyn ManagedEntity>> {
        let meta = binding.meta;
        let id = record
            .get(meta.id_column)
            .and_then(|value| value.as_i64())
            .ok_or_else(|| {
                DbError::ExecutionError(format!("{} row without a key", meta.name))
            })?;
        if let Some(existing) = self.get(meta.name, id) {
            return Ok(existing);
        }
        let seq = self.next_seq();
        let cell = (binding.load)(seq, record, read_only)?;
        self.insert(Arc::clone(&cell));
        Ok(cell)
    }

    pub fn collection(
        &self,
        owner: EntityKey,
        relation: &'static str,
    ) -> Option<Vec<Arc<dyn ManagedEntity>>> {
        self.collections.get(&(owner, relation)).cloned()
    }

    pub fn cache_collection(
        &mut self,
        owner: EntityKey,
        relation: &'static str,
        members: Vec<Arc<dyn ManagedEntity>>,
    ) {
        self.collections.insert((owner, relation), members);
    }
}
