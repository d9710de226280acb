use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{ExecContext, SessionId};

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    owner: SessionId,
    expires_at: Instant,
}

/// Exclusive row locks taken by `SELECT ... FOR UPDATE`, keyed by
/// `(table, primary key)`. A lock past its lease counts as abandoned.
#[derive(Debug, Default)]
pub(crate) struct RowLocks {
    held: HashMap<(String, i64), HeldLock>,
}

/// Another unit of work holds one of the requested rows.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Blocked {
    pub owner: SessionId,
    pub expires_at: Instant,
}

impl RowLocks {
    pub fn blocker(&self, ctx: &ExecContext, table: &str, ids: &[i64]) -> Option<Blocked> {
        let now = Instant::now();
        ids.iter().find_map(|id| {
            self.held
                .get(&(table.to_string(), *id))
                .filter(|lock| lock.owner != ctx.owner && lock.expires_at > now)
                .map(|lock| Blocked {
                    owner: lock.owner,
                    expires_at: lock.expires_at,
                })
        })
    }

    /// Takes (or refreshes) the locks; callers check `blocker` first.
    pub fn acquire(&mut self, ctx: &ExecContext, table: &str, ids: &[i64]) {
        let expires_at = Instant::now() + ctx.lock_lease;
        for id in ids {
            self.held.insert(
                (table.to_string(), *id),
                HeldLock {
                    owner: ctx.owner,
                    expires_at,
                },
            );
        }
    }

    pub fn release(&mut self, owner: SessionId) -> usize {
        let before = self.held.len();
        self.held.retain(|_, lock| lock.owner != owner);
        before - self.held.len()
    }

    pub fn held_by(&self, owner: SessionId) -> usize {
        self.held.values().filter(|lock| lock.owner == owner).count()
    }
}

pub(crate) fn until(instant: Instant) -> Duration {
    instant.saturating_duration_since(Instant::now())
}
