use std::ops::Deref;
use std::sync::Arc;

use super::dto::MemberDto;
use super::member::Member;
use crate::config::PagingConfig;
use crate::core::Result;
use crate::mapping::EntityRegistry;
use crate::query::{
    BulkUpdate, CountQuery, EntityQuery, LockMode, Many, One, Optional, Page, PageRequest,
    PagedQuery, ViewQuery,
};
use crate::params;
use crate::repository::Repository;
use crate::session::{Managed, Session};

/// Every member query the application declares. All of them are parsed and
/// checked in [`MemberRepository::new`].
pub struct MemberRepository {
    base: Repository<Member>,
    by_username: EntityQuery<Member, Many>,
    by_username_and_age_greater_than: EntityQuery<Member, Many>,
    user: EntityQuery<Member, Many>,
    usernames: ViewQuery<String, Many>,
    member_dtos: ViewQuery<MemberDto, Many>,
    by_names: EntityQuery<Member, Many>,
    list_by_username: EntityQuery<Member, Many>,
    member_by_username: EntityQuery<Member, One>,
    optional_by_username: EntityQuery<Member, Optional>,
    by_age: PagedQuery<Member>,
    count_by_age: CountQuery,
    bulk_age_plus: BulkUpdate,
    fetch_join: EntityQuery<Member, Many>,
    all_with_team: EntityQuery<Member, Many>,
    entity_graph: EntityQuery<Member, Many>,
    entity_graph_by_username: EntityQuery<Member, Many>,
    read_only_by_username: EntityQuery<Member, One>,
    lock_by_username: EntityQuery<Member, Many>,
}

impl MemberRepository {
    pub fn new(registry: Arc<EntityRegistry>, paging: PagingConfig) -> Result<Self> {
        let base = Repository::<Member>::new(registry, paging)?;
        Ok(Self {
            by_username: base.method("findByUsername").build()?,
            by_username_and_age_greater_than: base
                .method("findByUsernameAndAgeGreaterThan")
                .build()?,
            user: base
                .jpql("select m from Member m where m.username = :username and m.age = :age")
                .build()?,
            usernames: base.jpql("select m.username from Member m").project()?,
            member_dtos: base
                .jpql("select new MemberDto(m.id, m.username, t.name) from Member m join m.team t")
                .project()?,
            by_names: base
                .jpql("select m from Member m where m.username in :names")
                .build()?,
            list_by_username: base.method("findListByUsername").build()?,
            member_by_username: base.method("findMemberByUsername").build()?,
            optional_by_username: base.method("findOptionalByUsername").build()?,
            by_age: base.method("findByAge").paged()?,
            count_by_age: base.method("countByAge").count()?,
            bulk_age_plus: base
                .jpql("update Member m set m.age = m.age + 1 where m.age >= :age")
                .modifying()?,
            fetch_join: base
                .jpql("select m from Member m left join fetch m.team")
                .build()?,
            all_with_team: base.method("findAll").graph(&["team"]).build()?,
            entity_graph: base
                .jpql("select m from Member m")
                .graph(&["team"])
                .build()?,
            entity_graph_by_username: base
                .method("findEntityGraphByUsername")
                .named_graph("Member.all")
                .build()?,
            read_only_by_username: base.method("findReadOnlyByUsername").read_only().build()?,
            lock_by_username: base
                .method("findLockByUsername")
                .lock(LockMode::PessimisticWrite)
                .build()?,
            base,
        })
    }

    pub async fn find_by_username(
        &self,
        session: &Session,
        username: &str,
    ) -> Result<Vec<Managed<Member>>> {
        self.by_username.fetch(session, params![username]).await
    }

    pub async fn find_by_username_and_age_greater_than(
        &self,
        session: &Session,
        username: &str,
        age: i32,
    ) -> Result<Vec<Managed<Member>>> {
        self.by_username_and_age_greater_than
            .fetch(session, params![username, age])
            .await
    }

    pub async fn find_user(
        &self,
        session: &Session,
        username: &str,
        age: i32,
    ) -> Result<Vec<Managed<Member>>> {
        let params = crate::statement::Params::new()
            .with("username", username)
            .with("age", age);
        self.user.fetch(session, params).await
    }

    pub async fn find_username_list(&self, session: &Session) -> Result<Vec<String>> {
        self.usernames.fetch(session, ()).await
    }

    /// Members with a team, projected in one select.
    pub async fn find_member_dto(&self, session: &Session) -> Result<Vec<MemberDto>> {
        self.member_dtos.fetch(session, ()).await
    }

    pub async fn find_by_names(
        &self,
        session: &Session,
        names: &[&str],
    ) -> Result<Vec<Managed<Member>>> {
        let params = crate::statement::Params::new().with("names", names.to_vec());
        self.by_names.fetch(session, params).await
    }

    pub async fn find_list_by_username(
        &self,
        session: &Session,
        username: &str,
    ) -> Result<Vec<Managed<Member>>> {
        self.list_by_username.fetch(session, params![username]).await
    }

    /// Exactly one member: `NotFound` when none, `AmbiguousResult` when
    /// several share the name.
    pub async fn find_member_by_username(
        &self,
        session: &Session,
        username: &str,
    ) -> Result<Managed<Member>> {
        self.member_by_username.fetch(session, params![username]).await
    }

    pub async fn find_optional_by_username(
        &self,
        session: &Session,
        username: &str,
    ) -> Result<Option<Managed<Member>>> {
        self.optional_by_username.fetch(session, params![username]).await
    }

    pub async fn find_by_age(
        &self,
        session: &Session,
        age: i32,
        request: &PageRequest,
    ) -> Result<Page<Managed<Member>>> {
        self.by_age.fetch(session, params![age], request).await
    }

    pub async fn count_by_age(&self, session: &Session, age: i32) -> Result<u64> {
        self.count_by_age.fetch(session, params![age]).await
    }

    /// Adds one year to every member aged `age` or older. Managed instances
    /// keep their old age until the session is cleared.
    pub async fn bulk_age_plus(&self, session: &Session, age: i32) -> Result<u64> {
        let params = crate::statement::Params::new().with("age", age);
        self.bulk_age_plus.execute(session, params).await
    }

    /// The bulk statement itself, for callers that want different options.
    pub fn bulk_age_plus_statement(&self) -> &BulkUpdate {
        &self.bulk_age_plus
    }

    pub async fn find_member_fetch_join(&self, session: &Session) -> Result<Vec<Managed<Member>>> {
        self.fetch_join.fetch(session, ()).await
    }

    /// Every member with its team loaded in the same select.
    pub async fn find_all(&self, session: &Session) -> Result<Vec<Managed<Member>>> {
        self.all_with_team.fetch(session, ()).await
    }

    pub async fn find_member_entity_graph(
        &self,
        session: &Session,
    ) -> Result<Vec<Managed<Member>>> {
        self.entity_graph.fetch(session, ()).await
    }

    pub async fn find_entity_graph_by_username(
        &self,
        session: &Session,
        username: &str,
    ) -> Result<Vec<Managed<Member>>> {
        self.entity_graph_by_username
            .fetch(session, params![username])
            .await
    }

    /// The member is loaded without dirty tracking: changes made to it are
    /// never written.
    pub async fn find_read_only_by_username(
        &self,
        session: &Session,
        username: &str,
    ) -> Result<Managed<Member>> {
        self.read_only_by_username.fetch(session, params![username]).await
    }

    /// `SELECT ... FOR UPDATE`: the rows stay locked until the session ends.
    pub async fn find_lock_by_username(
        &self,
        session: &Session,
        username: &str,
    ) -> Result<Vec<Managed<Member>>> {
        self.lock_by_username.fetch(session, params![username]).await
    }
}

impl Deref for MemberRepository {
    type Target = Repository<Member>;

    fn deref(&self) -> &Repository<Member> {
        &self.base
    }
}
