use super::{ShardConn, Transport, config::RingOptions};
use crate::core::{Result, ShardError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Connection pool for a single shard
///
/// Connections are dialed lazily through the shard's [`Transport`] and handed
/// out as [`PoolGuard`]s. A guard is either returned with [`PoolGuard::put`]
/// or thrown away with [`PoolGuard::discard`]; dropping it discards.
pub struct ShardPool {
    addr: String,
    opt: Arc<RingOptions>,
    transport: Arc<dyn Transport>,
    shared: Arc<PoolShared>,
}

struct PoolShared {
    /// Idle connections, most recently returned at the back
    idle: Mutex<VecDeque<PooledConnection>>,
    /// Open connections, idle or checked out
    total_connections: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale: AtomicU64,
    closed: AtomicBool,
}

/// A connection owned by the pool
struct PooledConnection {
    conn: Box<dyn ShardConn>,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(conn: Box<dyn ShardConn>) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        if let Some(lifetime) = max_lifetime {
            self.created_at.elapsed() > lifetime
        } else {
            false
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }

    fn refresh_last_used(&mut self) {
        self.last_used = Instant::now();
    }
}

impl ShardPool {
    pub fn new(addr: &str, opt: Arc<RingOptions>, transport: Arc<dyn Transport>) -> Self {
        Self {
            addr: addr.to_string(),
            opt,
            transport,
            shared: Arc::new(PoolShared {
                idle: Mutex::new(VecDeque::new()),
                total_connections: AtomicUsize::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                stale: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Get a connection from the pool
    ///
    /// Waits up to the pool timeout for a free slot, then fails with
    /// [`ShardError::PoolTimeout`].
    pub async fn get(&self) -> Result<PoolGuard> {
        let start = Instant::now();
        let pool_timeout = self.opt.effective_pool_timeout();

        loop {
            if self.is_closed() {
                return Err(ShardError::RegistryClosed);
            }

            if let Some(mut pooled) = self.try_get_idle().await {
                pooled.refresh_last_used();
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.guard(pooled));
            }

            if self.try_reserve_slot() {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                return match self.dial().await {
                    Ok(conn) => Ok(self.guard(PooledConnection::new(conn))),
                    Err(err) => {
                        self.shared.total_connections.fetch_sub(1, Ordering::SeqCst);
                        Err(err)
                    }
                };
            }

            if start.elapsed() >= pool_timeout {
                self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(ShardError::PoolTimeout);
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Probe the shard over a pooled connection.
    pub async fn ping(&self) -> Result<()> {
        let mut guard = self.get().await?;
        match guard.connection().ping().await {
            Ok(()) => {
                guard.put().await;
                Ok(())
            }
            Err(err) => {
                guard.discard();
                Err(err)
            }
        }
    }

    /// Close the pool and every idle connection.
    ///
    /// Connections checked out at close time are dropped when their guard is released.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Err(ShardError::RegistryClosed);
        }
        let mut idle = self.shared.idle.lock().await;
        let dropped = idle.len();
        idle.clear();
        self.shared
            .total_connections
            .fetch_sub(dropped, Ordering::SeqCst);
        debug!(addr = %self.addr, dropped, "shard pool closed");
        Ok(())
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let idle = self.shared.idle.lock().await;
        PoolStats {
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            timeouts: self.shared.timeouts.load(Ordering::Relaxed),
            total_conns: self.shared.total_connections.load(Ordering::SeqCst) as u64,
            idle_conns: idle.len() as u64,
            stale_conns: self.shared.stale.load(Ordering::Relaxed),
        }
    }

    fn guard(&self, pooled: PooledConnection) -> PoolGuard {
        PoolGuard {
            pooled: Some(pooled),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Pop the most recently used live connection, closing expired ones on the way
    async fn try_get_idle(&self) -> Option<PooledConnection> {
        let mut idle = self.shared.idle.lock().await;

        let mut kept = VecDeque::with_capacity(idle.len());
        let mut removed = 0usize;
        while let Some(pooled) = idle.pop_front() {
            if pooled.is_expired(self.opt.pool.max_lifetime)
                || pooled.is_idle_too_long(self.opt.pool.idle_timeout)
            {
                removed += 1;
            } else {
                kept.push_back(pooled);
            }
        }
        *idle = kept;

        if removed > 0 {
            self.shared
                .total_connections
                .fetch_sub(removed, Ordering::SeqCst);
            self.shared
                .stale
                .fetch_add(removed as u64, Ordering::Relaxed);
        }

        idle.pop_back()
    }

    /// Claim room for one more connection if under `pool_size`
    fn try_reserve_slot(&self) -> bool {
        let max = self.opt.pool.pool_size;
        self.shared
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < max).then_some(total + 1)
            })
            .is_ok()
    }

    async fn dial(&self) -> Result<Box<dyn ShardConn>> {
        match tokio::time::timeout(
            self.opt.dial_timeout,
            self.transport.connect(&self.addr, &self.opt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ShardError::transport(
                crate::core::TransportKind::Timeout,
                format!("dial {} timed out", self.addr),
            )),
        }
    }
}

/// Connection pool statistics, summed across shards by the ring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Checkouts served by an idle connection
    pub hits: u64,
    /// Checkouts that had to dial
    pub misses: u64,
    /// Checkouts that gave up waiting
    pub timeouts: u64,
    pub total_conns: u64,
    pub idle_conns: u64,
    /// Connections closed for exceeding idle timeout or lifetime
    pub stale_conns: u64,
}

impl std::ops::AddAssign for PoolStats {
    fn add_assign(&mut self, other: Self) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.timeouts += other.timeouts;
        self.total_conns += other.total_conns;
        self.idle_conns += other.idle_conns;
        self.stale_conns += other.stale_conns;
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {} total, {} idle, {} stale, hits {}, misses {}, timeouts {}",
            self.total_conns,
            self.idle_conns,
            self.stale_conns,
            self.hits,
            self.misses,
            self.timeouts
        )
    }
}

/// RAII guard for a checked-out connection
///
/// Dropping the guard without calling [`PoolGuard::put`] closes the connection.
pub struct PoolGuard {
    pooled: Option<PooledConnection>,
    shared: Arc<PoolShared>,
}

impl PoolGuard {
    /// Get a reference to the connection
    pub fn connection(&mut self) -> &mut dyn ShardConn {
        self.pooled
            .as_mut()
            .map(|pooled| pooled.conn.as_mut())
            .expect("Connection already returned to pool")
    }

    /// Return the connection to the pool.
    ///
    /// Broken connections, and any connection of a closed pool, are discarded instead.
    pub async fn put(mut self) {
        let Some(mut pooled) = self.pooled.take() else {
            return;
        };
        if pooled.conn.is_broken() || self.shared.closed.load(Ordering::SeqCst) {
            self.shared.total_connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        pooled.refresh_last_used();
        let mut idle = self.shared.idle.lock().await;
        idle.push_back(pooled);
    }

    /// Close the connection instead of returning it.
    pub fn discard(mut self) {
        if self.pooled.take().is_some() {
            self.shared.total_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if self.pooled.take().is_some() {
            self.shared.total_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
