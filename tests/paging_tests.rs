/// Page requests: windowing, totals, sort precedence and size limits.
///
/// Run with: cargo test --test paging_tests
use std::sync::Arc;

use entity_session::domain::{self, Member, MemberRepository, Team};
use entity_session::{
    DbError, Direction, MemoryStore, OrmConfig, PageRequest, PagingConfig, Persistence, Sort,
};
use pretty_assertions::assert_eq;

async fn setup(config: OrmConfig) -> (Persistence, Arc<MemoryStore>, MemberRepository) {
    let store = Arc::new(MemoryStore::new());
    let persistence = Persistence::new(store.clone(), domain::registry().unwrap(), config)
        .await
        .unwrap();
    let repository = persistence.member_repository().unwrap();
    (persistence, store, repository)
}

/// member1..member5, all aged 10, plus one older member that never matches.
async fn seed(persistence: &Persistence) {
    let session = persistence.session();
    for i in 1..=5 {
        session.save(Member::new(format!("member{}", i), 10)).await.unwrap();
    }
    session.save(Member::new("elder", 70)).await.unwrap();
    session.commit().await.unwrap();
}

fn names(page: &entity_session::Page<entity_session::Managed<Member>>) -> Vec<String> {
    page.content()
        .iter()
        .map(|m| m.read(|m| m.username.clone()))
        .collect()
}

#[tokio::test]
async fn test_first_page_sorted_by_username_desc() {
    let (persistence, store, repository) = setup(OrmConfig::default()).await;
    seed(&persistence).await;
    let session = persistence.session();

    store.clear_statements();
    let request = PageRequest::sorted(0, 3, Sort::by(Direction::Desc, &["username"]));
    let page = repository.find_by_age(&session, 10, &request).await.unwrap();

    assert_eq!(names(&page), vec!["member5", "member4", "member3"]);
    assert_eq!(page.number(), 0);
    assert_eq!(page.size(), 3);
    assert_eq!(page.number_of_elements(), 3);
    assert_eq!(page.total_elements(), 5);
    assert_eq!(page.total_pages(), 2);
    assert!(page.is_first());
    assert!(!page.is_last());
    assert!(page.has_next());
    assert!(!page.has_previous());

    // Content first, then the count over the same filter.
    assert_eq!(
        store.statements(),
        vec![
            "SELECT m.* FROM member m WHERE m.age = 10 ORDER BY m.username DESC, m.member_id ASC LIMIT 3 OFFSET 0"
                .to_string(),
            "SELECT COUNT(*) FROM member m WHERE m.age = 10".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_last_page_holds_the_remainder() {
    let (persistence, _, repository) = setup(OrmConfig::default()).await;
    seed(&persistence).await;
    let session = persistence.session();

    let first = PageRequest::sorted(0, 3, Sort::by(Direction::Desc, &["username"]));
    let page = repository.find_by_age(&session, 10, &first.next()).await.unwrap();
    assert_eq!(names(&page), vec!["member2", "member1"]);
    assert!(page.is_last());
    assert!(!page.has_next());
    assert!(page.has_previous());

    let beyond = repository
        .find_by_age(&session, 10, &PageRequest::of(5, 3))
        .await
        .unwrap();
    assert!(beyond.content().is_empty());
    assert_eq!(beyond.total_elements(), 5);
}

#[tokio::test]
async fn test_huge_page_index_is_an_empty_last_page() {
    let (persistence, _, repository) = setup(OrmConfig::default()).await;
    seed(&persistence).await;
    let session = persistence.session();

    let page = repository
        .find_by_age(&session, 10, &PageRequest::of(usize::MAX, 3))
        .await
        .unwrap();
    assert!(page.content().is_empty());
    assert_eq!(page.number(), usize::MAX);
    assert_eq!(page.total_elements(), 5);
    assert_eq!(page.total_pages(), 2);
    assert!(page.is_last());
    assert!(!page.has_next());
}

#[tokio::test]
async fn test_page_map_keeps_metadata() {
    let (persistence, _, repository) = setup(OrmConfig::default()).await;
    seed(&persistence).await;
    let session = persistence.session();

    let page = repository
        .find_by_age(&session, 10, &PageRequest::of(0, 2))
        .await
        .unwrap();
    let mapped = page.map(|m| m.read(|m| m.age));
    assert_eq!(mapped.content(), &[10, 10]);
    assert_eq!(mapped.total_pages(), 3);
}

#[tokio::test]
async fn test_size_zero_is_rejected() {
    let (persistence, _, repository) = setup(OrmConfig::default()).await;
    let session = persistence.session();

    let err = repository
        .find_by_age(&session, 10, &PageRequest::of(0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[tokio::test]
async fn test_size_is_clamped_to_maximum() {
    let config = OrmConfig::default().paging(PagingConfig::default().default_page_size(2).max_page_size(4));
    let (persistence, _, repository) = setup(config).await;
    seed(&persistence).await;
    let session = persistence.session();

    let page = repository
        .find_by_age(&session, 10, &PageRequest::of(0, 100))
        .await
        .unwrap();
    assert_eq!(page.size(), 4);
    assert_eq!(page.number_of_elements(), 4);
    assert_eq!(page.total_pages(), 2);
}

#[tokio::test]
async fn test_default_sort_applies_to_unsorted_requests() {
    let (persistence, store, repository) = setup(OrmConfig::default()).await;
    seed(&persistence).await;
    let session = persistence.session();

    store.clear_statements();
    let page = repository
        .find_by_age(&session, 10, &PageRequest::of(0, 2))
        .await
        .unwrap();
    assert_eq!(names(&page), vec!["member5", "member4"]);
    assert!(store.statements()[0].contains("ORDER BY m.username DESC, m.member_id ASC"));

    let first = repository.find_all_paged(&session, &PageRequest::of(0, 12)).await.unwrap();
    assert_eq!(first.total_elements(), 6);
}

#[tokio::test]
async fn test_default_sort_is_skipped_when_it_does_not_apply() {
    let (persistence, store, _) = setup(OrmConfig::default()).await;
    let session = persistence.session();
    for name in ["teamB", "teamA"] {
        session.save(Team::new(name)).await.unwrap();
    }
    session.flush().await.unwrap();

    let teams = persistence.repository::<Team>().unwrap();
    store.clear_statements();
    let page = teams.find_all_paged(&session, &PageRequest::of(0, 10)).await.unwrap();
    assert_eq!(page.total_elements(), 2);
    assert!(store.statements()[0].contains("ORDER BY t.team_id ASC"));
}

#[tokio::test]
async fn test_request_sort_rejects_unknown_property() {
    let (persistence, _, repository) = setup(OrmConfig::default()).await;
    let session = persistence.session();

    let request = PageRequest::sorted(0, 3, Sort::by(Direction::Asc, &["shoeSize"]));
    let err = repository.find_by_age(&session, 10, &request).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[tokio::test]
async fn test_configured_first_page() {
    let config = OrmConfig::default().paging(PagingConfig::default().default_page_size(3));
    let (persistence, _, _) = setup(config).await;
    seed(&persistence).await;

    let paged = persistence
        .member_repository()
        .unwrap()
        .method("findByAge")
        .paged()
        .unwrap();
    let request = paged.first_page();
    assert_eq!(request.size(), 3);

    let session = persistence.session();
    let page = paged
        .fetch(&session, entity_session::params![10], &request)
        .await
        .unwrap();
    assert_eq!(names(&page), vec!["member5", "member4", "member3"]);
}
