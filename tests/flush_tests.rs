/// Flush behaviour: statement order, flush modes, audit stamps, optimistic
/// versions and failure reporting.
///
/// Run with: cargo test --test flush_tests
use std::sync::Arc;

use entity_session::domain::{self, Member, MemberRepository, Team};
use entity_session::mapping::FieldMeta;
use entity_session::{
    DataType, DbError, Entity, EntityMeta, EntityRegistry, FlushMode, MemoryStore, OrmConfig,
    Persistence, Record, Result, SessionConfig, Value,
};

async fn setup(config: OrmConfig) -> (Persistence, Arc<MemoryStore>, MemberRepository) {
    let store = Arc::new(MemoryStore::new());
    let persistence = Persistence::new(store.clone(), domain::registry().unwrap(), config)
        .await
        .unwrap();
    let repository = persistence.member_repository().unwrap();
    (persistence, store, repository)
}

static DOCUMENT: EntityMeta = EntityMeta {
    name: "Document",
    table: "document",
    id_field: "id",
    id_column: "document_id",
    fields: &[
        FieldMeta::new("title", "title", DataType::Text).not_null(),
        FieldMeta::new("version", "version", DataType::Integer),
    ],
    relations: &[],
    version_field: Some("version"),
    graphs: &[],
};

#[derive(Debug, Clone, Default, PartialEq)]
struct Document {
    id: Option<i64>,
    title: String,
    version: Option<i64>,
}

impl Entity for Document {
    fn meta() -> &'static EntityMeta {
        &DOCUMENT
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("title", self.title.as_str())
            .with("version", self.version)
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.get_as("document_id")?,
            title: record.get_as("title")?,
            version: record.get_as("version")?,
        })
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "title" => self.title = entity_session::core::FromValue::from_value(&value)?,
            "version" => self.version = entity_session::core::FromValue::from_value(&value)?,
            other => return Err(entity_session::mapping::unknown_field(&DOCUMENT, other)),
        }
        Ok(())
    }

    fn version(&self) -> Option<i64> {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = Some(version);
    }
}

async fn documents() -> Persistence {
    let registry = EntityRegistry::new().register::<Document>().build().unwrap();
    Persistence::in_memory(registry, OrmConfig::default()).await.unwrap()
}

#[tokio::test]
async fn test_writes_follow_join_order() {
    let (persistence, store, _) = setup(OrmConfig::default()).await;
    let session = persistence.session();

    let team = session.save(Team::new("teamA")).await.unwrap();
    let member = session.save(Member::new("member1", 10)).await.unwrap();
    Member::change_team(&member, &team).unwrap();

    store.clear_statements();
    assert_eq!(session.flush().await.unwrap(), 2);
    let statements = store.statements();
    assert!(statements[0].starts_with("INSERT INTO team"));
    assert!(statements[1].starts_with("INSERT INTO member"));
    assert_eq!(member.read(|m| m.team_id), team.id());
}

#[tokio::test]
async fn test_reference_to_later_entity_is_transient() {
    let (persistence, store, _) = setup(OrmConfig::default()).await;
    let session = persistence.session();

    // The member joins first, so its team has no key yet when it is written.
    let member = session.save(Member::new("member1", 10)).await.unwrap();
    let team = session.save(Team::new("teamA")).await.unwrap();
    Member::change_team(&member, &team).unwrap();

    let err = session.flush().await.unwrap_err();
    assert!(matches!(err, DbError::FlushFailed { .. }));
    assert!(matches!(err.root(), DbError::TransientReference(_)));
    assert_eq!(store.row_count("member").await.unwrap(), 0);
}

#[tokio::test]
async fn test_constraint_violation_is_reported_with_the_entity() {
    let (persistence, store, _) = setup(OrmConfig::default()).await;
    let session = persistence.session();

    let orphan = Member {
        team_id: Some(999),
        ..Member::new("orphan", 10)
    };
    let member = session.save(orphan).await.unwrap();
    let err = session.flush().await.unwrap_err();
    assert!(err.is_constraint_violation(), "{:?}", err);
    assert!(err.to_string().contains("Member"), "{}", err);
    assert!(member.is_new());
    assert_eq!(store.row_count("member").await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_flush_keeps_earlier_statements() {
    let (persistence, store, _) = setup(OrmConfig::default()).await;
    let session = persistence.session();

    session.save(Member::new("member1", 10)).await.unwrap();
    session
        .save(Member {
            team_id: Some(999),
            ..Member::new("orphan", 10)
        })
        .await
        .unwrap();
    assert!(session.flush().await.is_err());
    assert_eq!(store.row_count("member").await.unwrap(), 1);
}

#[tokio::test]
async fn test_auto_mode_flushes_before_queries() {
    let (persistence, _, repository) = setup(OrmConfig::default()).await;
    let session = persistence.session();

    session.save(Member::new("member1", 10)).await.unwrap();
    let found = repository.find_by_username(&session, "member1").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(repository.count(&session).await.unwrap(), 1);
}

#[tokio::test]
async fn test_manual_mode_defers_until_flush() {
    let config = OrmConfig::default().session(SessionConfig::default().flush_mode(FlushMode::Manual));
    let (persistence, store, repository) = setup(config).await;
    let session = persistence.session();

    let member = session.save(Member::new("member1", 10)).await.unwrap();
    assert!(repository.find_by_username(&session, "member1").await.unwrap().is_empty());
    assert_eq!(repository.count(&session).await.unwrap(), 0);

    session.flush().await.unwrap();
    let found = repository.find_by_username(&session, "member1").await.unwrap();
    assert!(entity_session::Managed::ptr_eq(&member, &found[0]));

    // close() drops pending work.
    member.set("age", 50).unwrap();
    session.close().await.unwrap();
    let fresh = persistence.session();
    assert_eq!(fresh.get::<Member>(member.id().unwrap()).await.unwrap().read(|m| m.age), 10);
    assert_eq!(store.row_count("member").await.unwrap(), 1);
}

#[tokio::test]
async fn test_audit_stamps() {
    let config = OrmConfig::default().session(SessionConfig::default().auditor("admin"));
    let (persistence, _, _) = setup(config).await;
    let session = persistence.session();

    let member = session.save(Member::new("member1", 10)).await.unwrap();
    session.flush().await.unwrap();
    let audit = member.read(|m| m.audit.clone());
    assert_eq!(audit.created_by.as_deref(), Some("admin"));
    assert_eq!(audit.last_modified_by.as_deref(), Some("admin"));
    let created = audit.created_date.unwrap();
    assert_eq!(audit.last_modified_date, Some(created));

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let editor = persistence.session_with(SessionConfig::default().auditor("editor"));
    let loaded = editor.get::<Member>(member.id().unwrap()).await.unwrap();
    loaded.set("age", 11).unwrap();
    editor.commit().await.unwrap();

    let check = persistence.session();
    let stored = check.get::<Member>(member.id().unwrap()).await.unwrap();
    let audit = stored.read(|m| m.audit.clone());
    assert_eq!(audit.created_date, Some(created));
    assert_eq!(audit.created_by.as_deref(), Some("admin"));
    assert_eq!(audit.last_modified_by.as_deref(), Some("editor"));
    assert!(audit.last_modified_date.unwrap() > created);
}

#[tokio::test]
async fn test_version_increments_on_update() {
    let persistence = documents().await;
    let session = persistence.session();

    let document = session
        .save(Document {
            title: "draft".into(),
            ..Document::default()
        })
        .await
        .unwrap();
    session.flush().await.unwrap();
    assert_eq!(document.read(|d| d.version), Some(0));

    document.set("title", "final").unwrap();
    session.flush().await.unwrap();
    assert_eq!(document.read(|d| d.version), Some(1));
}

#[tokio::test]
async fn test_stale_version_is_a_conflict() {
    let persistence = documents().await;
    let setup = persistence.session();
    let document = setup
        .save(Document {
            title: "draft".into(),
            ..Document::default()
        })
        .await
        .unwrap();
    setup.commit().await.unwrap();
    let id = document.id().unwrap();

    let first = persistence.session();
    let second = persistence.session();
    let mine = first.get::<Document>(id).await.unwrap();
    let theirs = second.get::<Document>(id).await.unwrap();

    mine.set("title", "mine").unwrap();
    first.commit().await.unwrap();

    theirs.set("title", "theirs").unwrap();
    let err = second.flush().await.unwrap_err();
    assert!(matches!(err.root(), DbError::ConcurrencyConflict(_)), "{:?}", err);
    // The failed write leaves the instance's version untouched.
    assert_eq!(theirs.read(|d| d.version), Some(0));

    let check = persistence.session();
    let stored = check.get::<Document>(id).await.unwrap();
    assert_eq!(stored.read(|d| (d.title.clone(), d.version)), ("mine".to_string(), Some(1)));
}

#[tokio::test]
async fn test_updating_a_deleted_row_is_a_conflict() {
    let (persistence, _, _) = setup(OrmConfig::default()).await;
    let setup = persistence.session();
    let member = setup.save(Member::new("member1", 10)).await.unwrap();
    setup.commit().await.unwrap();
    let id = member.id().unwrap();

    let first = persistence.session();
    let second = persistence.session();
    let a = first.get::<Member>(id).await.unwrap();
    let b = second.get::<Member>(id).await.unwrap();

    first.remove(&a).unwrap();
    first.commit().await.unwrap();

    b.set("age", 20).unwrap();
    let err = second.flush().await.unwrap_err();
    assert!(matches!(err.root(), DbError::ConcurrencyConflict(_)));
}

#[tokio::test]
async fn test_registry_rejects_bad_version_field() {
    static BROKEN: EntityMeta = EntityMeta {
        name: "Broken",
        table: "broken",
        id_field: "id",
        id_column: "broken_id",
        fields: &[FieldMeta::new("title", "title", DataType::Text)],
        relations: &[],
        version_field: Some("title"),
        graphs: &[],
    };

    #[derive(Debug, Clone)]
    struct Broken;

    impl Entity for Broken {
        fn meta() -> &'static EntityMeta {
            &BROKEN
        }
        fn id(&self) -> Option<i64> {
            None
        }
        fn set_id(&mut self, _id: i64) {}
        fn to_record(&self) -> Record {
            Record::new()
        }
        fn from_record(_record: &Record) -> Result<Self> {
            Ok(Broken)
        }
        fn set_field(&mut self, _field: &str, _value: Value) -> Result<()> {
            Ok(())
        }
    }

    let err = EntityRegistry::new().register::<Broken>().build().err().unwrap();
    assert!(matches!(err, DbError::Validation(_)));
}
