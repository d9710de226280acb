/// Pessimistic row locks taken by locking reads.
///
/// Run with: cargo test --test locking_tests
use std::sync::Arc;
use std::time::{Duration, Instant};

use entity_session::domain::{self, Member, MemberRepository, Team};
use entity_session::{DbError, MemoryStore, OrmConfig, Persistence, SessionConfig};

async fn setup() -> (Persistence, Arc<MemoryStore>, MemberRepository) {
    let store = Arc::new(MemoryStore::new());
    let persistence = Persistence::new(store.clone(), domain::registry().unwrap(), OrmConfig::default())
        .await
        .unwrap();
    let repository = persistence.member_repository().unwrap();

    let session = persistence.session();
    session.save(Member::new("member1", 10)).await.unwrap();
    session.save(Member::new("member2", 20)).await.unwrap();
    session.commit().await.unwrap();
    (persistence, store, repository)
}

fn impatient() -> SessionConfig {
    SessionConfig::default().lock_timeout(Duration::from_millis(100))
}

#[tokio::test]
async fn test_locking_read_renders_for_update() {
    let (persistence, store, repository) = setup().await;
    let session = persistence.session();

    store.clear_statements();
    let locked = repository.find_lock_by_username(&session, "member1").await.unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(
        store.statements(),
        vec!["SELECT m.* FROM member m WHERE m.username = 'member1' FOR UPDATE".to_string()]
    );
    assert_eq!(store.locks_held_by(session.id()).await, 1);

    let id = session.id();
    session.close().await.unwrap();
    assert_eq!(store.locks_held_by(id).await, 0);
}

#[tokio::test]
async fn test_locked_row_blocks_other_writers_until_timeout() {
    let (persistence, _, repository) = setup().await;
    let holder = persistence.session();
    repository.find_lock_by_username(&holder, "member1").await.unwrap();

    let writer = persistence.session_with(impatient());
    let member = repository.find_member_by_username(&writer, "member1").await.unwrap();
    member.set("age", 11).unwrap();
    let err = writer.flush().await.unwrap_err();
    assert!(matches!(err, DbError::FlushFailed { .. }));
    assert!(matches!(err.root(), DbError::LockTimeout(_)));

    // Rows nobody locked stay writable.
    let free = persistence.session_with(impatient());
    let other = repository.find_member_by_username(&free, "member2").await.unwrap();
    other.set("age", 21).unwrap();
    assert_eq!(free.commit().await.unwrap(), 1);
}

#[tokio::test]
async fn test_second_locking_read_waits() {
    let (persistence, _, repository) = setup().await;
    let holder = persistence.session();
    repository.find_lock_by_username(&holder, "member1").await.unwrap();

    let contender = persistence.session_with(impatient());
    let err = repository
        .find_lock_by_username(&contender, "member1")
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::LockTimeout(_)));

    // Plain reads are never blocked.
    let reader = persistence.session_with(impatient());
    let found = repository.find_by_username(&reader, "member1").await.unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn test_waiting_writer_proceeds_after_commit() {
    let (persistence, _, repository) = setup().await;
    let holder = persistence.session();
    let locked = repository.find_lock_by_username(&holder, "member1").await.unwrap();
    locked[0].set("age", 30).unwrap();

    let writer = persistence.session();
    let member = repository.find_member_by_username(&writer, "member1").await.unwrap();
    let waiting = tokio::spawn(async move {
        member.set("username", "renamed").unwrap();
        writer.commit().await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    holder.commit().await.unwrap();
    assert_eq!(waiting.await.unwrap().unwrap(), 1);

    let check = persistence.session();
    let stored = repository.find_member_by_username(&check, "renamed").await.unwrap();
    assert_eq!(stored.read(|m| m.age), 30);
}

#[tokio::test]
async fn test_failed_commit_releases_its_locks() {
    let (persistence, store, repository) = setup().await;
    let holder = persistence.session();
    let owner = holder.id();
    let locked = repository.find_lock_by_username(&holder, "member1").await.unwrap();
    locked[0].set("age", 31).unwrap();
    assert_eq!(store.locks_held_by(owner).await, 1);

    // The newcomer joins before its team, so the flush cannot resolve its key.
    let newcomer = holder.save(Member::new("member3", 30)).await.unwrap();
    let team = holder.save(Team::new("teamA")).await.unwrap();
    Member::change_team(&newcomer, &team).unwrap();

    let err = holder.commit().await.unwrap_err();
    assert!(matches!(err.root(), DbError::TransientReference(_)), "{:?}", err);
    assert_eq!(store.locks_held_by(owner).await, 0);

    let writer = persistence.session_with(impatient());
    let member = repository.find_member_by_username(&writer, "member1").await.unwrap();
    member.set("age", 32).unwrap();
    assert_eq!(writer.commit().await.unwrap(), 1);
}

#[tokio::test]
async fn test_dropped_session_releases_its_locks() {
    let (persistence, store, repository) = setup().await;
    let holder = persistence.session();
    let holder_id = holder.id();
    repository.find_lock_by_username(&holder, "member1").await.unwrap();
    drop(holder);

    let writer = persistence.session_with(SessionConfig::default().lock_timeout(Duration::from_secs(2)));
    let member = repository.find_member_by_username(&writer, "member1").await.unwrap();
    member.set("age", 12).unwrap();
    writer.commit().await.unwrap();
    assert_eq!(store.locks_held_by(holder_id).await, 0);
}

#[tokio::test]
async fn test_abandoned_lock_expires_with_its_lease() {
    let (persistence, _, repository) = setup().await;
    let holder = persistence.session_with(SessionConfig::default().lock_lease(Duration::from_millis(100)));
    repository.find_lock_by_username(&holder, "member1").await.unwrap();

    let writer = persistence.session_with(SessionConfig::default().lock_timeout(Duration::from_secs(2)));
    let member = repository.find_member_by_username(&writer, "member1").await.unwrap();
    member.set("age", 13).unwrap();

    let started = Instant::now();
    writer.commit().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));

    // The holder never released anything; closing it is still harmless.
    holder.close().await.unwrap();
}
