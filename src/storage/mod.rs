//! The relational store the persistence context runs against.
//!
//! [`Store`] is the connection abstraction the session consumes;
//! [`MemoryStore`] is the bundled in-process implementation.

mod eval;
mod locks;
pub mod memory;
pub mod table;

pub use memory::MemoryStore;
pub use table::{Table, TableSchema};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::Result;
use crate::result::QueryResult;
use crate::statement::{Select, Statement};

/// Identifies one unit of work towards the store, for row-lock ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecContext {
    pub owner: SessionId,
    /// How long a statement waits for rows locked by another unit of work.
    pub lock_timeout: Duration,
    /// How long a row lock taken by this unit of work stays valid.
    pub lock_lease: Duration,
}

impl ExecContext {
    pub fn new(owner: SessionId, lock_timeout: Duration, lock_lease: Duration) -> Self {
        Self {
            owner,
            lock_timeout,
            lock_lease,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub affected: u64,
    /// Surrogate key assigned by an INSERT.
    pub generated_id: Option<i64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_table(&self, schema: TableSchema) -> Result<()>;

    async fn query(&self, ctx: &ExecContext, select: &Select) -> Result<QueryResult>;

    async fn execute(&self, ctx: &ExecContext, statement: &Statement) -> Result<ExecOutcome>;

    /// Releases every row lock held by `owner`, returning how many.
    async fn release_locks(&self, owner: SessionId) -> Result<usize>;
}
