use super::hashtag;
use super::ring::{DEFAULT_REPLICAS, HashRing};
use super::shard::Shard;
use crate::connection::Transport;
use crate::connection::config::RingOptions;
use crate::connection::pool::ShardPool;
use crate::core::{Result, ShardError};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::watch;
use tracing::{Level, event, warn};

/// Owns the ring's shards and the current hash ring snapshot.
///
/// Lookups take the read lock; rebuild and close take the write lock only
/// long enough to swap state. The lock is never held across an await point.
pub struct ShardRegistry {
    state: RwLock<RegistryState>,
    shutdown: watch::Sender<bool>,
}

struct RegistryState {
    ring: Arc<HashRing>,
    /// Read only until close
    shards: HashMap<String, Arc<Shard>>,
    /// Same shards, sorted by name
    list: Vec<Arc<Shard>>,
    closed: bool,
}

impl ShardRegistry {
    /// Creates one shard and pool per configured address; every shard starts up.
    pub fn new(opt: Arc<RingOptions>, transport: Arc<dyn Transport>) -> Result<Self> {
        opt.validate()?;

        let mut shards = HashMap::new();
        let mut list = Vec::with_capacity(opt.addrs.len());
        for (name, addr) in &opt.addrs {
            let pool = ShardPool::new(addr, Arc::clone(&opt), Arc::clone(&transport));
            let shard = Arc::new(Shard::new(name, pool));
            shards.insert(name.clone(), Arc::clone(&shard));
            list.push(shard);
        }

        let ring = HashRing::build(DEFAULT_REPLICAS, opt.addrs.keys());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            state: RwLock::new(RegistryState {
                ring: Arc::new(ring),
                shards,
                list,
                closed: false,
            }),
            shutdown,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shard owning `key`, routing tagged keys by their tag.
    pub fn resolve_by_key(&self, key: &str) -> Result<Arc<Shard>> {
        let key = hashtag::key(key);

        let state = self.read();
        if state.closed {
            return Err(ShardError::RegistryClosed);
        }

        let name = state.ring.get(key).ok_or(ShardError::AllShardsDown)?;
        state
            .shards
            .get(name)
            .cloned()
            .ok_or_else(|| ShardError::ShardNotFound(name.to_string()))
    }

    /// Shard named `name`; an empty name picks a random up shard.
    pub fn resolve_by_name<R: Rng>(&self, name: &str, rng: &mut R) -> Result<Arc<Shard>> {
        if name.is_empty() {
            return self.random(rng);
        }

        let state = self.read();
        if state.closed {
            return Err(ShardError::RegistryClosed);
        }
        state
            .shards
            .get(name)
            .cloned()
            .ok_or_else(|| ShardError::ShardNotFound(name.to_string()))
    }

    /// Random up shard, chosen by hashing a random number through the ring.
    pub fn random<R: Rng>(&self, rng: &mut R) -> Result<Arc<Shard>> {
        let key = rng.random::<u64>().to_string();
        self.resolve_by_key(&key)
    }

    /// Name of the shard owning an already canonicalized key.
    pub fn hash(&self, key: &str) -> Option<String> {
        self.read().ring.get(key).map(str::to_string)
    }

    /// Every shard, up or down. Empty once closed.
    pub fn list(&self) -> Vec<Arc<Shard>> {
        self.read().list.clone()
    }

    /// Shards currently voted up.
    pub fn live(&self) -> Vec<Arc<Shard>> {
        self.list().into_iter().filter(|shard| shard.is_up()).collect()
    }

    /// Current ring snapshot.
    pub fn ring(&self) -> Arc<HashRing> {
        Arc::clone(&self.read().ring)
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Rebuilds the ring from the shards that are currently up.
    pub fn rebuild(&self) {
        let live = self
            .list()
            .into_iter()
            .filter(|shard| shard.is_up())
            .map(|shard| shard.name().to_string())
            .collect::<Vec<_>>();
        let ring = Arc::new(HashRing::build(DEFAULT_REPLICAS, &live));

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        state.ring = ring;
        drop(state);

        if live.is_empty() {
            warn!("ring rebuilt with no live shards");
        } else {
            event!(Level::INFO, live = ?live, "ring rebuilt");
        }
    }

    /// Signal observed by background tasks; flips to `true` on close.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Closes every shard pool and stops background tasks.
    ///
    /// Idempotent. Every pool is closed even if some fail; the first failure is returned.
    pub async fn close(&self) -> Result<()> {
        let shards = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.ring = Arc::new(HashRing::new(DEFAULT_REPLICAS));
            state.shards.clear();
            std::mem::take(&mut state.list)
        };

        self.shutdown.send_replace(true);

        let mut first_err = None;
        for shard in shards {
            if let Err(err) = shard.pool().close().await {
                warn!(shard = %shard.name(), error = %err, "failed to close shard pool");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
