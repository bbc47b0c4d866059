use crate::connection::pool::ShardPool;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Consecutive failed health checks after which a shard is considered down.
pub const DOWN_THRESHOLD: u32 = 3;

/// One backend shard of the ring.
///
/// The failure counter is the only state mutated outside the registry lock;
/// it is written by the heartbeat and read by routing.
pub struct Shard {
    name: String,
    addr: String,
    pool: ShardPool,
    failures: AtomicU32,
}

impl Shard {
    pub fn new(name: &str, pool: ShardPool) -> Self {
        Self {
            name: name.to_string(),
            addr: pool.addr().to_string(),
            pool,
            failures: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn pool(&self) -> &ShardPool {
        &self.pool
    }

    /// Consecutive failed votes, saturating at [`DOWN_THRESHOLD`].
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn is_down(&self) -> bool {
        self.failures() >= DOWN_THRESHOLD
    }

    pub fn is_up(&self) -> bool {
        !self.is_down()
    }

    /// Records a health check outcome and reports whether up/down flipped.
    ///
    /// One up vote restores a down shard; it takes [`DOWN_THRESHOLD`]
    /// consecutive down votes to take it out.
    pub fn vote(&self, up: bool) -> bool {
        if up {
            let previous = self.failures.swap(0, Ordering::SeqCst);
            return previous >= DOWN_THRESHOLD;
        }

        match self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < DOWN_THRESHOLD).then_some(n + 1)
            }) {
            Ok(previous) => previous + 1 == DOWN_THRESHOLD,
            Err(_) => false,
        }
    }

    pub fn status(&self) -> ShardStatus {
        ShardStatus {
            name: self.name.clone(),
            addr: self.addr.clone(),
            up: self.is_up(),
            failures: self.failures(),
        }
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_up() { "up" } else { "down" };
        write!(f, "{} ({}) is {}", self.name, self.addr, state)
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("failures", &self.failures())
            .finish()
    }
}

/// Point-in-time view of a shard, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub name: String,
    pub addr: String,
    pub up: bool,
    pub failures: u32,
}
