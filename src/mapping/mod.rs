//! Entity metadata: how a Rust type maps onto one table of the store.

pub mod audit;
pub mod registry;

pub use audit::{Audit, AuditContext};
pub use registry::EntityRegistry;

use std::fmt;

use crate::core::{DataType, Record, Result, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: &'static str,
    pub column: &'static str,
    pub data_type: DataType,
    pub nullable: bool,
    pub unique: bool,
}

impl FieldMeta {
    pub const fn new(name: &'static str, column: &'static str, data_type: DataType) -> Self {
        Self {
            name,
            column,
            data_type,
            nullable: true,
            unique: false,
        }
    }

    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Owning side: `fk_field` holds the target's key.
    ManyToOne { fk_field: &'static str },
    /// Inverse side, derived from the target's many-to-one `mapped_by`.
    OneToMany { mapped_by: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationMeta {
    pub name: &'static str,
    /// Entity name of the other side.
    pub target: &'static str,
    pub kind: RelationKind,
}

impl RelationMeta {
    pub fn is_collection(&self) -> bool {
        matches!(self.kind, RelationKind::OneToMany { .. })
    }
}

/// A reusable set of relations to load eagerly, e.g. `Member.all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedGraph {
    pub name: &'static str,
    pub paths: &'static [&'static str],
}

#[derive(Debug, PartialEq, Eq)]
pub struct EntityMeta {
    /// Name used in literal queries (`from Member m`).
    pub name: &'static str,
    pub table: &'static str,
    pub id_field: &'static str,
    pub id_column: &'static str,
    /// Persistent fields other than the key.
    pub fields: &'static [FieldMeta],
    pub relations: &'static [RelationMeta],
    /// Integer field checked and bumped on every update when present.
    pub version_field: Option<&'static str>,
    pub graphs: &'static [NamedGraph],
}

impl EntityMeta {
    pub fn field(&self, name: &str) -> Option<&'static FieldMeta> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Column of a field, the key included.
    pub fn column_for(&self, field: &str) -> Option<&'static str> {
        if field == self.id_field {
            return Some(self.id_column);
        }
        self.field(field).map(|field| field.column)
    }

    pub fn relation(&self, name: &str) -> Option<&'static RelationMeta> {
        self.relations.iter().find(|relation| relation.name == name)
    }

    pub fn graph(&self, name: &str) -> Option<&'static NamedGraph> {
        self.graphs.iter().find(|graph| graph.name == name)
    }

    pub fn version_column(&self) -> Option<&'static str> {
        self.version_field.and_then(|field| self.column_for(field))
    }

    /// Every declared field name, for error messages.
    pub fn field_names(&self) -> Vec<&'static str> {
        std::iter::once(self.id_field)
            .chain(self.fields.iter().map(|field| field.name))
            .collect()
    }
}

impl fmt::Display for EntityMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A persistent type. Implementations describe themselves through a static
/// [`EntityMeta`] and convert to and from column records; the session does
/// the rest.
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    fn meta() -> &'static EntityMeta;

    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    /// Column values of every persistent field except the key.
    fn to_record(&self) -> Record;

    /// Rebuilds an instance from a full row, key included.
    fn from_record(record: &Record) -> Result<Self>;

    /// Assigns one field by name.
    fn set_field(&mut self, field: &str, value: Value) -> Result<()>;

    /// Runs right before the entity is inserted.
    fn on_persist(&mut self, _ctx: &AuditContext) {}

    /// Runs right before a changed entity is updated.
    fn on_update(&mut self, _ctx: &AuditContext) {}

    fn version(&self) -> Option<i64> {
        None
    }

    fn set_version(&mut self, _version: i64) {}
}

/// Error for `set_field` on an undeclared or non-assignable field.
pub fn unknown_field(meta: &EntityMeta, field: &str) -> crate::core::DbError {
    crate::core::DbError::Validation(format!(
        "{} has no assignable field '{}' (fields: {})",
        meta.name,
        field,
        meta.field_names().join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    static THING: EntityMeta = EntityMeta {
        name: "Thing",
        table: "thing",
        id_field: "id",
        id_column: "thing_id",
        fields: &[
            FieldMeta::new("label", "label", DataType::Text).not_null(),
            FieldMeta::new("owner_id", "owner_id", DataType::Integer),
        ],
        relations: &[RelationMeta {
            name: "owner",
            target: "Owner",
            kind: RelationKind::ManyToOne {
                fk_field: "owner_id",
            },
        }],
        version_field: None,
        graphs: &[NamedGraph {
            name: "Thing.owner",
            paths: &["owner"],
        }],
    };

    #[test]
    fn test_column_lookup_includes_key() {
        assert_eq!(THING.column_for("id"), Some("thing_id"));
        assert_eq!(THING.column_for("label"), Some("label"));
        assert_eq!(THING.column_for("missing"), None);
    }

    #[test]
    fn test_relation_and_graph_lookup() {
        assert!(!THING.relation("owner").unwrap().is_collection());
        assert_eq!(THING.graph("Thing.owner").unwrap().paths, &["owner"]);
        let err = unknown_field(&THING, "nope");
        assert!(err.to_string().contains("nope"));
        assert!(err.to_string().contains("label"));
    }
}
