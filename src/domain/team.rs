use serde::Serialize;

use crate::core::{DataType, FromValue, Record, Result, Value};
use crate::mapping::{
    Audit, AuditContext, Entity, EntityMeta, FieldMeta, RelationKind, RelationMeta, unknown_field,
};

pub static TEAM: EntityMeta = EntityMeta {
    name: "Team",
    table: "team",
    id_field: "id",
    id_column: "team_id",
    fields: &[
        FieldMeta::new("name", "name", DataType::Text).not_null(),
        Audit::CREATED_DATE,
        Audit::LAST_MODIFIED_DATE,
        Audit::CREATED_BY,
        Audit::LAST_MODIFIED_BY,
    ],
    relations: &[RelationMeta {
        name: "members",
        target: "Member",
        kind: RelationKind::OneToMany { mapped_by: "team" },
    }],
    version_field: None,
    graphs: &[],
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    #[serde(skip)]
    pub audit: Audit,
}

impl Team {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Entity for Team {
    fn meta() -> &'static EntityMeta {
        &TEAM
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn to_record(&self) -> Record {
        let mut record = Record::new().with("name", self.name.as_str());
        self.audit.write(&mut record);
        record
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.get_as(TEAM.id_column)?,
            name: record.get_as("name")?,
            audit: Audit::read(record)?,
        })
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "name" => self.name = String::from_value(&value)?,
            other => return Err(unknown_field(&TEAM, other)),
        }
        Ok(())
    }

    fn on_persist(&mut self, ctx: &AuditContext) {
        self.audit.on_persist(ctx);
    }

    fn on_update(&mut self, ctx: &AuditContext) {
        self.audit.on_update(ctx);
    }
}
