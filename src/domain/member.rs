use serde::Serialize;

use super::team::Team;
use crate::core::{DataType, FromValue, Record, Result, Value};
use crate::mapping::{
    Audit, AuditContext, Entity, EntityMeta, FieldMeta, NamedGraph, RelationKind, RelationMeta,
    unknown_field,
};
use crate::session::Managed;

pub static MEMBER: EntityMeta = EntityMeta {
    name: "Member",
    table: "member",
    id_field: "id",
    id_column: "member_id",
    fields: &[
        FieldMeta::new("username", "username", DataType::Text).not_null(),
        FieldMeta::new("age", "age", DataType::Integer).not_null(),
        FieldMeta::new("team_id", "team_id", DataType::Integer),
        Audit::CREATED_DATE,
        Audit::LAST_MODIFIED_DATE,
        Audit::CREATED_BY,
        Audit::LAST_MODIFIED_BY,
    ],
    relations: &[RelationMeta {
        name: "team",
        target: "Team",
        kind: RelationKind::ManyToOne { fk_field: "team_id" },
    }],
    version_field: None,
    graphs: &[NamedGraph {
        name: "Member.all",
        paths: &["team"],
    }],
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Member {
    pub id: Option<i64>,
    pub username: String,
    pub age: i32,
    /// Owning side of `team`; the only place membership is stored.
    pub team_id: Option<i64>,
    #[serde(skip)]
    pub audit: Audit,
}

impl Member {
    pub fn new(username: impl Into<String>, age: i32) -> Self {
        Self {
            username: username.into(),
            age,
            ..Self::default()
        }
    }

    pub fn named(username: impl Into<String>) -> Self {
        Self::new(username, 0)
    }

    /// Moves `member` to `team`. The team's member list is derived from this
    /// reference and refreshes after the session is cleared.
    pub fn change_team(member: &Managed<Member>, team: &Managed<Team>) -> Result<()> {
        member.set_reference("team", team)
    }
}

impl Entity for Member {
    fn meta() -> &'static EntityMeta {
        &MEMBER
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn to_record(&self) -> Record {
        let mut record = Record::new()
            .with("username", self.username.as_str())
            .with("age", self.age)
            .with("team_id", self.team_id);
        self.audit.write(&mut record);
        record
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.get_as(MEMBER.id_column)?,
            username: record.get_as("username")?,
            age: record.get_as("age")?,
            team_id: record.get_as("team_id")?,
            audit: Audit::read(record)?,
        })
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "username" => self.username = String::from_value(&value)?,
            "age" => self.age = i32::from_value(&value)?,
            "team_id" => self.team_id = Option::<i64>::from_value(&value)?,
            other => return Err(unknown_field(&MEMBER, other)),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let member = Member {
            id: Some(4),
            team_id: Some(1),
            ..Member::new("member1", 10)
        };
        let mut record = member.to_record();
        record.set("member_id", 4);
        assert_eq!(Member::from_record(&record).unwrap(), member);
    }

    #[test]
    fn test_set_field() {
        let mut member = Member::named("a");
        member.set_field("age", Value::Integer(20)).unwrap();
        member.set_field("team_id", Value::Null).unwrap();
        assert_eq!(member.age, 20);
        assert!(member.set_field("nickname", Value::from("x")).is_err());
        assert!(member.set_field("age", Value::from("old")).is_err());
    }
}
