//! The member/team model the crate ships with: two entities, a view object
//! and the member repository's declared queries.

mod dto;
mod member;
mod member_repository;
mod team;

pub use dto::MemberDto;
pub use member::{MEMBER, Member};
pub use member_repository::MemberRepository;
pub use team::{TEAM, Team};

use std::sync::Arc;

use crate::core::Result;
use crate::mapping::EntityRegistry;
use crate::repository::Repository;

pub type TeamRepository = Repository<Team>;

/// Registry with `Team` and `Member`.
pub fn registry() -> Result<Arc<EntityRegistry>> {
    EntityRegistry::new()
        .register::<Team>()
        .register::<Member>()
        .build()
}
