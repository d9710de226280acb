use serde::Serialize;

use super::member::Member;
use crate::core::{DbError, FromValue, Result, Value};
use crate::query::FromRow;

/// What leaves the system instead of a `Member`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDto {
    pub id: i64,
    pub username: String,
    pub team_name: Option<String>,
}

impl MemberDto {
    pub fn new(id: i64, username: impl Into<String>, team_name: Option<String>) -> Self {
        Self {
            id,
            username: username.into(),
            team_name,
        }
    }

    /// Fails for a member that was never flushed.
    pub fn from_member(member: &Member, team_name: Option<String>) -> Result<Self> {
        let id = member.id.ok_or_else(|| {
            DbError::TransientReference(format!("member '{}' has no key yet", member.username))
        })?;
        Ok(Self::new(id, member.username.clone(), team_name))
    }
}

/// `new MemberDto(m.id, m.username, t.name)`
impl FromRow for MemberDto {
    const ARITY: usize = 3;

    fn from_row(values: &[Value]) -> Result<Self> {
        match values {
            [id, username, team_name] => Ok(Self {
                id: i64::from_value(id)?,
                username: String::from_value(username)?,
                team_name: Option::<String>::from_value(team_name)?,
            }),
            _ => Err(DbError::TypeMismatch(format!(
                "MemberDto takes 3 columns, got {}",
                values.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_row() {
        let dto = MemberDto::from_row(&[Value::Integer(1), Value::from("AAA"), Value::from("teamA")])
            .unwrap();
        assert_eq!(dto, MemberDto::new(1, "AAA", Some("teamA".into())));
        assert!(MemberDto::from_row(&[Value::Integer(1)]).is_err());
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(MemberDto::new(1, "AAA", None)).unwrap();
        assert_eq!(json["teamName"], serde_json::Value::Null);
        assert_eq!(json["username"], "AAA");
    }
}
