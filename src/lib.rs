// ============================================================================
// ShardRing Library
// ============================================================================

pub mod cluster;
pub mod connection;
pub mod core;
pub mod executor;

// Re-export main types for convenience
pub use crate::core::{Command, Reply, Result, ShardError, TransportKind};

pub use cluster::{CommandInfo, HashRing, Shard, ShardRegistry, ShardStatus};
pub use connection::{
    DispatchPhase, SendFailure, ShardConn, Transport,
    config::{BackoffSetting, PoolOptions, RingOptions},
    memory::{InMemoryBackend, InMemoryTransport},
    pool::PoolStats,
};
pub use executor::{BatchResult, Pipeline};

use cluster::{CommandInfoCache, heartbeat};
use executor::BatchExecutor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

// ============================================================================
// High-level Ring API
// ============================================================================

/// Client for a set of independent shards
///
/// Keys are spread over the shards with a consistent hash ring. A background
/// heartbeat takes unresponsive shards out of the ring and puts them back when
/// they recover; batches are split per shard and unsent failures are retried.
///
/// # Examples
///
/// ```
/// use shardring::{Command, InMemoryTransport, Ring, RingOptions};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = InMemoryTransport::new();
/// transport.add_backend("mem:1");
/// transport.add_backend("mem:2");
///
/// let options = RingOptions::new()
///     .shard("a", "mem:1")
///     .shard("b", "mem:2");
/// let ring = Ring::new(options, Arc::new(transport))?;
///
/// ring.process(&mut Command::set("user:1", "alice")).await?;
/// let reply = ring.process(&mut Command::get("user:1")).await?;
/// assert_eq!(reply.as_str(), Some("alice"));
///
/// ring.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Ring {
    opt: Arc<RingOptions>,
    transport: Arc<dyn Transport>,
    registry: Arc<ShardRegistry>,
    executor: BatchExecutor,
    cmd_info: CommandInfoCache,
    /// Seeds one random source per request
    seeds: Mutex<StdRng>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Ring {
    /// Create a ring and start its heartbeat
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(options: RingOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        tokio::runtime::Handle::try_current().map_err(|_| {
            ShardError::Config("a ring must be created inside a Tokio runtime".to_string())
        })?;

        let opt = Arc::new(options.normalized());
        let registry = Arc::new(ShardRegistry::new(
            Arc::clone(&opt),
            Arc::clone(&transport),
        )?);
        let seeds = match opt.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let heartbeat = heartbeat::spawn_heartbeat(Arc::clone(&registry), opt.heartbeat());
        info!(
            shards = opt.addrs.len(),
            heartbeat = ?opt.heartbeat(),
            max_retries = opt.max_retries,
            "ring started"
        );

        Ok(Self {
            executor: BatchExecutor::new(Arc::clone(&registry), Arc::clone(&opt)),
            opt,
            transport,
            registry,
            cmd_info: CommandInfoCache::new(),
            seeds: Mutex::new(seeds),
            heartbeat: Mutex::new(Some(heartbeat)),
        })
    }

    /// Create a ring from a `ring://` URL
    ///
    /// # Examples
    ///
    /// ```
    /// # use shardring::{InMemoryTransport, Ring};
    /// # use std::sync::Arc;
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let transport = InMemoryTransport::new();
    /// transport.add_backend("mem:1");
    ///
    /// let ring = Ring::from_url("ring://a=mem:1?max_retries=2", Arc::new(transport))?;
    /// assert_eq!(ring.options().max_retries, 2);
    /// # ring.close().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_url(url: &str, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::new(RingOptions::from_url(url)?, transport)
    }

    /// Options in effect, with defaults resolved
    pub fn options(&self) -> &RingOptions {
        &self.opt
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// Shard currently owning `key`
    pub fn resolve(&self, key: &str) -> Result<Arc<Shard>> {
        self.registry.resolve_by_key(key)
    }

    /// Name of the shard currently owning `key`
    pub fn shard_for_key(&self, key: &str) -> Result<String> {
        self.resolve(key).map(|shard| shard.name().to_string())
    }

    /// Status of every shard, up or down
    pub fn shards(&self) -> Vec<ShardStatus> {
        self.registry
            .list()
            .iter()
            .map(|shard| shard.status())
            .collect()
    }

    /// Execute a batch of commands
    ///
    /// Each command gets its own result; the returned error is the first
    /// command error in submission order.
    pub async fn execute(&self, cmds: &mut [Command]) -> Result<()> {
        let span = info_span!("batch", commands = cmds.len());
        let mut rng = self.request_rng();
        let table = self.command_table().await;
        self.executor
            .execute(cmds, table, &mut rng)
            .instrument(span)
            .await
    }

    /// Execute a single command
    pub async fn process(&self, cmd: &mut Command) -> Result<Reply> {
        let mut rng = self.request_rng();
        let table = self.command_table().await;
        self.executor.process(cmd, table, &mut rng).await
    }

    /// Start a pipeline
    ///
    /// # Examples
    ///
    /// ```
    /// # use shardring::{InMemoryTransport, Ring, RingOptions};
    /// # use std::sync::Arc;
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let transport = InMemoryTransport::new();
    /// # transport.add_backend("mem:1");
    /// # let ring = Ring::new(RingOptions::new().shard("a", "mem:1"), Arc::new(transport))?;
    /// let mut pipe = ring.pipeline();
    /// pipe.cmd(["set", "counter", "41"]).cmd(["incr", "counter"]);
    ///
    /// let result = pipe.exec().await;
    /// assert!(result.is_ok());
    /// assert_eq!(result.cmds[1].reply().and_then(|r| r.as_i64()), Some(42));
    /// # Ok(())
    /// # }
    /// ```
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(self)
    }

    /// Build and execute a pipeline in one call
    pub async fn pipelined<F>(&self, build: F) -> BatchResult
    where
        F: FnOnce(&mut Pipeline<'_>),
    {
        let mut pipe = self.pipeline();
        build(&mut pipe);
        pipe.exec().await
    }

    /// Run `f` concurrently on every live shard
    pub async fn for_each_live_shard<F, Fut>(&self, f: F) -> Result<()>
    where
        F: Fn(Arc<Shard>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        executor::for_each_live_shard(&self.registry, f).await
    }

    /// Pool statistics summed over every shard
    pub async fn pool_stats(&self) -> PoolStats {
        let mut total = PoolStats::default();
        for shard in self.registry.list() {
            total += shard.pool().stats().await;
        }
        total
    }

    /// Run one health sweep now, without waiting for the next heartbeat
    pub async fn check_health(&self) -> bool {
        heartbeat::sweep_once(&self.registry).await
    }

    /// Close every shard pool and stop the heartbeat
    ///
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let result = self.registry.close().await;

        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "heartbeat task ended abnormally");
            }
            info!("ring closed");
        }
        result
    }

    fn request_rng(&self) -> StdRng {
        let seed = self
            .seeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random();
        StdRng::seed_from_u64(seed)
    }

    async fn command_table(&self) -> &HashMap<String, CommandInfo> {
        self.cmd_info
            .get_or_fallback(|| self.load_command_info())
            .await
    }

    /// Command table from the first shard that answers
    async fn load_command_info(&self) -> Result<HashMap<String, CommandInfo>> {
        let mut first_err = None;
        for shard in self.registry.list() {
            match self.transport.command_info(shard.addr(), &self.opt).await {
                Ok(table) => return Ok(table),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        Err(first_err.unwrap_or(ShardError::AllShardsDown))
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        let handle = self
            .heartbeat
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(names: &[&str]) -> (Ring, InMemoryTransport) {
        let transport = InMemoryTransport::new();
        let mut opt = RingOptions::new().rng_seed(17);
        for (i, name) in names.iter().enumerate() {
            let addr = format!("mem:{i}");
            transport.add_backend(&addr);
            opt = opt.shard(name, &addr);
        }
        let ring = Ring::new(opt, Arc::new(transport.clone())).unwrap();
        (ring, transport)
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = Ring::new(
            RingOptions::new().shard("a", "mem:0"),
            Arc::new(InMemoryTransport::new()),
        );
        assert!(matches!(result, Err(ShardError::Config(_))));
    }

    #[tokio::test]
    async fn test_options_are_normalized() {
        let (ring, _) = ring(&["a"]);
        assert_eq!(ring.options().heartbeat_frequency, ring.options().heartbeat());
        assert!(ring.options().pool.pool_timeout.is_some());
        ring.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shard_for_key_matches_ring() {
        let (ring, _) = ring(&["a", "b", "c"]);
        let name = ring.shard_for_key("user:1").unwrap();
        assert_eq!(ring.registry().hash("user:1"), Some(name));
        assert_eq!(ring.shards().len(), 3);
        ring.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pipelined() {
        let (ring, _) = ring(&["a", "b"]);
        let result = ring
            .pipelined(|pipe| {
                pipe.push(Command::set("x", "1")).push(Command::incr("x"));
            })
            .await;
        let cmds = result.into_result().unwrap();
        assert_eq!(cmds[1].reply(), Some(&Reply::Integer(2)));
        ring.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_stats_sum_shards() {
        let (ring, _) = ring(&["a", "b", "c"]);
        let mut cmds = (0..50)
            .map(|i| Command::set(format!("k{i}"), "v"))
            .collect::<Vec<_>>();
        ring.execute(&mut cmds).await.unwrap();

        let stats = ring.pool_stats().await;
        assert_eq!(stats.total_conns, 3);
        assert_eq!(stats.idle_conns, 3);
        ring.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (ring, _) = ring(&["a"]);
        ring.close().await.unwrap();
        ring.close().await.unwrap();
        assert_eq!(
            ring.process(&mut Command::get("k")).await,
            Err(ShardError::RegistryClosed)
        );
    }
}
