/// Loading configuration from JSON and environment-style variables.
///
/// Run with: cargo test --test config_tests
use std::time::Duration;

use entity_session::domain;
use entity_session::{DbError, Direction, FlushMode, OrmConfig, Persistence, Sort, Store};

#[test]
fn test_from_json_overrides_defaults() {
    let config = OrmConfig::from_json(
        r#"{
            "paging": { "default_page_size": 20, "default_sort": null },
            "session": { "flush_mode": "manual", "lock_timeout_ms": 250, "auditor": "batch" }
        }"#,
    )
    .unwrap();

    assert_eq!(config.paging.default_page_size, 20);
    assert_eq!(config.paging.max_page_size, 2000);
    assert_eq!(config.paging.default_sort, None);
    assert_eq!(config.session.flush_mode, FlushMode::Manual);
    assert_eq!(config.session.lock_timeout_duration(), Duration::from_millis(250));
    assert_eq!(config.session.auditor.as_deref(), Some("batch"));
}

#[test]
fn test_from_json_rejects_bad_input() {
    assert!(matches!(OrmConfig::from_json("{ not json"), Err(DbError::Config(_))));
    assert!(matches!(
        OrmConfig::from_json(r#"{ "session": { "flush_mode": "sometimes" } }"#),
        Err(DbError::Config(_))
    ));
    assert!(matches!(
        OrmConfig::from_json(r#"{ "paging": { "default_page_size": 0 } }"#),
        Err(DbError::Config(_))
    ));
    assert!(matches!(
        OrmConfig::from_json(r#"{ "paging": { "default_page_size": 50, "max_page_size": 10 } }"#),
        Err(DbError::Config(_))
    ));
}

#[test]
fn test_from_vars() {
    let config = OrmConfig::from_vars([
        ("ENTITY_SESSION_DEFAULT_PAGE_SIZE", "5"),
        ("ENTITY_SESSION_DEFAULT_SORT", "age,desc;username"),
        ("ENTITY_SESSION_FLUSH_MODE", "MANUAL"),
        ("ENTITY_SESSION_LOCK_LEASE_MS", "1000"),
        ("PATH", "/usr/bin"),
    ])
    .unwrap();

    assert_eq!(config.paging.default_page_size, 5);
    assert_eq!(
        config.paging.default_sort,
        Some(Sort::by(Direction::Desc, &["age"]).and(Sort::by(Direction::Asc, &["username"])))
    );
    assert_eq!(config.session.flush_mode, FlushMode::Manual);
    assert_eq!(config.session.lock_lease_ms, 1000);

    let request = config.paging.request(2);
    assert_eq!(request.page(), 2);
    assert_eq!(request.size(), 5);
}

#[test]
fn test_from_vars_rejects_bad_values() {
    for (key, value) in [
        ("ENTITY_SESSION_MAX_PAGE_SIZE", "lots"),
        ("ENTITY_SESSION_FLUSH_MODE", "eventually"),
        ("ENTITY_SESSION_DEFAULT_SORT", "age,sideways"),
        ("ENTITY_SESSION_LOCK_LEASE_MS", "0"),
        ("ENTITY_SESSION_AUDITOR", ""),
    ] {
        let result = OrmConfig::from_vars([(key, value)]);
        assert!(matches!(result, Err(DbError::Config(_))), "{}={}", key, value);
    }

    let unsorted = OrmConfig::from_vars([("ENTITY_SESSION_DEFAULT_SORT", "")]).unwrap();
    assert_eq!(unsorted.paging.default_sort, None);
}

#[tokio::test]
async fn test_persistence_refuses_invalid_config() {
    let mut config = OrmConfig::default();
    config.paging.max_page_size = 0;
    let result = Persistence::in_memory(domain::registry().unwrap(), config).await;
    assert!(matches!(result, Err(DbError::Config(_))));
}

#[tokio::test]
async fn test_tables_are_installed_once() {
    let persistence = Persistence::in_memory(domain::registry().unwrap(), OrmConfig::default())
        .await
        .unwrap();
    let again = persistence
        .registry()
        .install(persistence.store().as_ref())
        .await;
    assert!(matches!(again, Err(DbError::TableExists(_))));

    let store: &dyn Store = persistence.store().as_ref();
    let registry = domain::registry().unwrap();
    let schema = registry.table_schema(registry.meta("Member").unwrap()).unwrap();
    assert!(matches!(store.create_table(schema).await, Err(DbError::TableExists(_))));
}
