/// Bulk UPDATE statements and their interaction with managed instances.
///
/// Run with: cargo test --test bulk_update_tests
use std::sync::Arc;

use entity_session::domain::{self, Member, MemberRepository};
use entity_session::{
    DbError, FlushMode, MemoryStore, OrmConfig, Params, Persistence, SessionConfig,
};

async fn setup() -> (Persistence, Arc<MemoryStore>, MemberRepository) {
    let store = Arc::new(MemoryStore::new());
    let persistence = Persistence::new(store.clone(), domain::registry().unwrap(), OrmConfig::default())
        .await
        .unwrap();
    let repository = persistence.member_repository().unwrap();
    (persistence, store, repository)
}

async fn seed(persistence: &Persistence) {
    let session = persistence.session();
    for (i, age) in [10, 19, 20, 21, 40].into_iter().enumerate() {
        session
            .save(Member::new(format!("member{}", i + 1), age))
            .await
            .unwrap();
    }
    session.commit().await.unwrap();
}

#[tokio::test]
async fn test_bulk_update_counts_affected_rows() {
    let (persistence, store, repository) = setup().await;
    seed(&persistence).await;
    let session = persistence.session();

    store.clear_statements();
    let affected = repository.bulk_age_plus(&session, 20).await.unwrap();
    assert_eq!(affected, 3);
    assert_eq!(
        store.statements(),
        vec!["UPDATE member m SET age = m.age + 1 WHERE m.age >= 20".to_string()]
    );

    let fresh = persistence.session();
    let mut ages: Vec<i32> = repository
        .find_all(&fresh)
        .await
        .unwrap()
        .iter()
        .map(|m| m.read(|m| m.age))
        .collect();
    ages.sort();
    assert_eq!(ages, vec![10, 19, 21, 22, 41]);
}

#[tokio::test]
async fn test_managed_instances_keep_stale_values_until_cleared() {
    let (persistence, _, repository) = setup().await;
    seed(&persistence).await;
    let session = persistence.session();

    let member5 = repository.find_member_by_username(&session, "member5").await.unwrap();
    assert_eq!(member5.read(|m| m.age), 40);

    repository.bulk_age_plus(&session, 20).await.unwrap();

    // The query reads 41 from the store, but the managed instance wins.
    let again = repository.find_member_by_username(&session, "member5").await.unwrap();
    assert!(entity_session::Managed::ptr_eq(&member5, &again));
    assert_eq!(again.read(|m| m.age), 40);

    session.clear().unwrap();
    let reloaded = repository.find_member_by_username(&session, "member5").await.unwrap();
    assert_eq!(reloaded.read(|m| m.age), 41);
}

#[tokio::test]
async fn test_clear_automatically() {
    let (persistence, _, repository) = setup().await;
    seed(&persistence).await;
    let session = persistence.session();

    let member5 = repository.find_member_by_username(&session, "member5").await.unwrap();
    let clearing = repository.bulk_age_plus_statement().clone().clear_automatically();
    assert!(clearing.options().clear_automatically);

    let affected = clearing
        .execute(&session, Params::new().with("age", 20))
        .await
        .unwrap();
    assert_eq!(affected, 3);
    assert_eq!(session.managed_count(), 0);
    assert!(!session.contains(&member5));

    let reloaded = repository.find_member_by_username(&session, "member5").await.unwrap();
    assert_eq!(reloaded.read(|m| m.age), 41);
}

#[tokio::test]
async fn test_pending_changes_are_flushed_before_the_statement() {
    let (persistence, _, repository) = setup().await;
    seed(&persistence).await;

    // Auto mode: the pending insert lands before the update runs.
    let session = persistence.session();
    session.save(Member::new("member6", 50)).await.unwrap();
    assert_eq!(repository.bulk_age_plus(&session, 20).await.unwrap(), 4);

    // Manual mode only flushes first when asked to.
    let manual = persistence.session_with(SessionConfig::default().flush_mode(FlushMode::Manual));
    manual.save(Member::new("member7", 60)).await.unwrap();
    assert_eq!(repository.bulk_age_plus(&manual, 20).await.unwrap(), 4);

    let flushing = repository.bulk_age_plus_statement().clone().flush_automatically();
    assert_eq!(
        flushing
            .execute(&manual, Params::new().with("age", 20))
            .await
            .unwrap(),
        5
    );
}

#[tokio::test]
async fn test_bulk_delete() {
    let (persistence, store, repository) = setup().await;
    seed(&persistence).await;
    let session = persistence.session();

    let delete = repository
        .jpql("delete from Member m where m.age < :age")
        .modifying()
        .unwrap();
    let affected = delete
        .execute(&session, Params::new().with("age", 20))
        .await
        .unwrap();
    assert_eq!(affected, 2);
    assert_eq!(store.row_count("member").await.unwrap(), 3);
}

#[tokio::test]
async fn test_modifying_rejects_selects_and_hints() {
    let (_, _, repository) = setup().await;

    let err = repository
        .jpql("select m from Member m")
        .modifying()
        .err()
        .unwrap();
    assert!(matches!(err, DbError::Validation(_)));

    let err = repository
        .jpql("update Member m set m.age = 0")
        .read_only()
        .modifying()
        .err()
        .unwrap();
    assert!(matches!(err, DbError::Validation(_)));
}
