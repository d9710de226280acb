use chrono::{DateTime, Utc};
use serde::Serialize;

use super::FieldMeta;
use crate::core::{DataType, Record, Result, Value};

/// Who and when, handed to lifecycle hooks at flush time.
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub now: DateTime<Utc>,
    pub auditor: Option<String>,
}

impl AuditContext {
    pub fn new(auditor: Option<String>) -> Self {
        Self {
            now: Utc::now(),
            auditor,
        }
    }
}

/// Creation and modification stamps embedded in an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Audit {
    pub created_date: Option<DateTime<Utc>>,
    pub last_modified_date: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub last_modified_by: Option<String>,
}

impl Audit {
    pub const CREATED_DATE: FieldMeta =
        FieldMeta::new("created_date", "created_date", DataType::Timestamp);
    pub const LAST_MODIFIED_DATE: FieldMeta =
        FieldMeta::new("last_modified_date", "last_modified_date", DataType::Timestamp);
    pub const CREATED_BY: FieldMeta = FieldMeta::new("created_by", "created_by", DataType::Text);
    pub const LAST_MODIFIED_BY: FieldMeta =
        FieldMeta::new("last_modified_by", "last_modified_by", DataType::Text);

    /// Set once, at insert.
    pub fn on_persist(&mut self, ctx: &AuditContext) {
        self.created_date = Some(ctx.now);
        self.created_by = ctx.auditor.clone();
        self.on_update(ctx);
    }

    pub fn on_update(&mut self, ctx: &AuditContext) {
        self.last_modified_date = Some(ctx.now);
        self.last_modified_by = ctx.auditor.clone();
    }

    pub fn write(&self, record: &mut Record) {
        record.set(Self::CREATED_DATE.column, self.created_date);
        record.set(Self::LAST_MODIFIED_DATE.column, self.last_modified_date);
        record.set(Self::CREATED_BY.column, self.created_by.clone());
        record.set(Self::LAST_MODIFIED_BY.column, self.last_modified_by.clone());
    }

    pub fn read(record: &Record) -> Result<Self> {
        Ok(Self {
            created_date: optional(record, Self::CREATED_DATE.column)?,
            last_modified_date: optional(record, Self::LAST_MODIFIED_DATE.column)?,
            created_by: optional(record, Self::CREATED_BY.column)?,
            last_modified_by: optional(record, Self::LAST_MODIFIED_BY.column)?,
        })
    }
}

fn optional<T: crate::core::FromValue>(record: &Record, column: &str) -> Result<Option<T>> {
    match record.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => record.get_as::<T>(column).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_stamps_are_set_once() {
        let mut audit = Audit::default();
        let first = AuditContext::new(Some("admin".into()));
        audit.on_persist(&first);

        let mut later = AuditContext::new(Some("editor".into()));
        later.now = first.now + chrono::Duration::seconds(5);
        audit.on_update(&later);

        assert_eq!(audit.created_date, Some(first.now));
        assert_eq!(audit.created_by.as_deref(), Some("admin"));
        assert_eq!(audit.last_modified_date, Some(later.now));
        assert_eq!(audit.last_modified_by.as_deref(), Some("editor"));
    }

    #[test]
    fn test_record_round_trip_keeps_nulls() {
        let mut record = Record::new();
        Audit::default().write(&mut record);
        assert_eq!(record.len(), 4);
        assert_eq!(Audit::read(&record).unwrap(), Audit::default());
    }
}
