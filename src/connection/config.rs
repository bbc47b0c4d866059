use crate::core::{Result, ShardError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
pub const DEFAULT_MIN_RETRY_BACKOFF: Duration = Duration::from_millis(8);
pub const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_millis(512);

const URL_SCHEME: &str = "ring://";

/// One bound of the retry backoff window.
///
/// In URL form `0` selects the default and `-1` disables the bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffSetting {
    #[default]
    Default,
    Disabled,
    Fixed(Duration),
}

impl BackoffSetting {
    pub fn resolve(self, default: Duration) -> Duration {
        match self {
            BackoffSetting::Default => default,
            BackoffSetting::Disabled => Duration::ZERO,
            BackoffSetting::Fixed(value) => value,
        }
    }

    fn from_millis(ms: i64) -> std::result::Result<Self, String> {
        match ms {
            -1 => Ok(BackoffSetting::Disabled),
            0 => Ok(BackoffSetting::Default),
            ms if ms > 0 => Ok(BackoffSetting::Fixed(Duration::from_millis(ms as u64))),
            ms => Err(format!("invalid backoff value {}", ms)),
        }
    }

    fn to_millis(self) -> i64 {
        match self {
            BackoffSetting::Default => 0,
            BackoffSetting::Disabled => -1,
            // A zero bound disables backoff; `0` in a URL would mean the default
            BackoffSetting::Fixed(value) if value.is_zero() => -1,
            BackoffSetting::Fixed(value) => value.as_millis() as i64,
        }
    }

    /// Concrete form used by `normalized`; a zero window is `Disabled`.
    fn concrete(self, default: Duration) -> Self {
        match self.resolve(default) {
            value if value.is_zero() => BackoffSetting::Disabled,
            value => BackoffSetting::Fixed(value),
        }
    }

    fn is_whole_millis(self) -> bool {
        match self {
            BackoffSetting::Fixed(value) => value.subsec_nanos() % 1_000_000 == 0,
            _ => true,
        }
    }
}

/// Settings forwarded unmodified to every shard's connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum number of connections per shard
    pub pool_size: usize,
    /// How long `get` waits for a free connection before failing with `PoolTimeout`.
    /// `None` means read timeout + 1s.
    pub pool_timeout: Option<Duration>,
    /// Idle connections older than this are closed on checkout
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are closed on checkout
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            pool_size: 10,
            pool_timeout: None,
            idle_timeout: Some(Duration::from_secs(300)),
            max_lifetime: None,
        }
    }
}

/// Ring client configuration
///
/// Shard membership is fixed at construction; everything else is tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingOptions {
    /// Shard name => address
    pub addrs: BTreeMap<String, String>,

    /// Interval between health sweeps. A shard is down after 3 failed sweeps.
    pub heartbeat_frequency: Duration,

    /// Extra attempts for retryable failures (0 = no retry)
    pub max_retries: usize,
    pub min_retry_backoff: BackoffSetting,
    pub max_retry_backoff: BackoffSetting,

    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    pub pool: PoolOptions,

    /// Seed for the any-shard and jitter random source
    pub rng_seed: Option<u64>,
}

impl RingOptions {
    pub fn new() -> Self {
        Self {
            addrs: BTreeMap::new(),
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            max_retries: 0,
            min_retry_backoff: BackoffSetting::Default,
            max_retry_backoff: BackoffSetting::Default,
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            pool: PoolOptions::default(),
            rng_seed: None,
        }
    }

    /// Add a shard
    pub fn shard(mut self, name: &str, addr: &str) -> Self {
        self.addrs.insert(name.to_string(), addr.to_string());
        self
    }

    pub fn heartbeat_frequency(mut self, frequency: Duration) -> Self {
        self.heartbeat_frequency = frequency;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn min_retry_backoff(mut self, setting: BackoffSetting) -> Self {
        self.min_retry_backoff = setting;
        self
    }

    pub fn max_retry_backoff(mut self, setting: BackoffSetting) -> Self {
        self.max_retry_backoff = setting;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool.pool_size = size;
        self
    }

    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool.pool_timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool.idle_timeout = Some(timeout);
        self
    }

    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.pool.max_lifetime = Some(lifetime);
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Effective heartbeat interval; zero falls back to the default.
    pub fn heartbeat(&self) -> Duration {
        if self.heartbeat_frequency.is_zero() {
            DEFAULT_HEARTBEAT_FREQUENCY
        } else {
            self.heartbeat_frequency
        }
    }

    pub fn min_backoff(&self) -> Duration {
        self.min_retry_backoff.resolve(DEFAULT_MIN_RETRY_BACKOFF)
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_retry_backoff.resolve(DEFAULT_MAX_RETRY_BACKOFF)
    }

    pub fn effective_pool_timeout(&self) -> Duration {
        self.pool
            .pool_timeout
            .unwrap_or(self.read_timeout + Duration::from_secs(1))
    }

    /// Copy with every default-able field resolved to its concrete value.
    ///
    /// A bound that resolves to zero stays `Disabled` so the result survives
    /// `to_url` / `from_url` unchanged.
    pub fn normalized(&self) -> Self {
        let mut opt = self.clone();
        opt.heartbeat_frequency = self.heartbeat();
        opt.min_retry_backoff = self.min_retry_backoff.concrete(DEFAULT_MIN_RETRY_BACKOFF);
        opt.max_retry_backoff = self.max_retry_backoff.concrete(DEFAULT_MAX_RETRY_BACKOFF);
        opt.pool.pool_timeout = Some(self.effective_pool_timeout());
        opt
    }

    /// Parse from a ring URL
    ///
    /// Format: `ring://name=host:port,name=host:port?option=value&...`
    ///
    /// # Examples
    ///
    /// ```
    /// # use shardring::RingOptions;
    /// let opt = RingOptions::from_url(
    ///     "ring://a=10.0.0.1:6379,b=10.0.0.2:6379?max_retries=3&min_retry_backoff_ms=-1"
    /// ).unwrap();
    /// assert_eq!(opt.addrs.len(), 2);
    /// assert_eq!(opt.max_retries, 3);
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| ShardError::Config(format!("URL must start with '{}'", URL_SCHEME)))?;

        let (shards, query) = match rest.split_once('?') {
            Some((shards, query)) => (shards, Some(query)),
            None => (rest, None),
        };

        let mut opt = Self::new();
        for entry in shards.split(',').filter(|e| !e.is_empty()) {
            let (name, addr) = entry
                .split_once('=')
                .ok_or_else(|| ShardError::Config(format!("Invalid shard entry '{}'", entry)))?;
            opt.addrs.insert(name.to_string(), addr.to_string());
        }

        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ShardError::Config(format!("Invalid option '{}'", pair)))?;
            opt.apply_url_option(key, value)
                .map_err(|e| ShardError::Config(format!("{}: {}", key, e)))?;
        }

        Ok(opt)
    }

    fn apply_url_option(&mut self, key: &str, value: &str) -> std::result::Result<(), String> {
        let millis = |v: &str| -> std::result::Result<Duration, String> {
            v.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| format!("invalid duration '{}'", v))
        };
        let number = |v: &str| -> std::result::Result<usize, String> {
            v.parse::<usize>().map_err(|_| format!("invalid number '{}'", v))
        };
        let signed = |v: &str| -> std::result::Result<i64, String> {
            v.parse::<i64>().map_err(|_| format!("invalid number '{}'", v))
        };

        match key {
            "heartbeat_ms" => self.heartbeat_frequency = millis(value)?,
            "max_retries" => self.max_retries = number(value)?,
            "min_retry_backoff_ms" => {
                self.min_retry_backoff = BackoffSetting::from_millis(signed(value)?)?
            }
            "max_retry_backoff_ms" => {
                self.max_retry_backoff = BackoffSetting::from_millis(signed(value)?)?
            }
            "dial_timeout_ms" => self.dial_timeout = millis(value)?,
            "read_timeout_ms" => self.read_timeout = millis(value)?,
            "write_timeout_ms" => self.write_timeout = millis(value)?,
            "pool_size" => self.pool.pool_size = number(value)?,
            "pool_timeout_ms" => self.pool.pool_timeout = Some(millis(value)?),
            "idle_timeout_ms" => self.pool.idle_timeout = Some(millis(value)?),
            "max_lifetime_ms" => self.pool.max_lifetime = Some(millis(value)?),
            "seed" => {
                self.rng_seed = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("invalid seed '{}'", value))?,
                )
            }
            _ => return Err("unknown option".to_string()),
        }
        Ok(())
    }

    /// Convert to a ring URL
    pub fn to_url(&self) -> String {
        let shards = self
            .addrs
            .iter()
            .map(|(name, addr)| format!("{}={}", name, addr))
            .collect::<Vec<_>>()
            .join(",");

        let mut params = vec![
            format!("heartbeat_ms={}", self.heartbeat_frequency.as_millis()),
            format!("max_retries={}", self.max_retries),
            format!("min_retry_backoff_ms={}", self.min_retry_backoff.to_millis()),
            format!("max_retry_backoff_ms={}", self.max_retry_backoff.to_millis()),
            format!("dial_timeout_ms={}", self.dial_timeout.as_millis()),
            format!("read_timeout_ms={}", self.read_timeout.as_millis()),
            format!("write_timeout_ms={}", self.write_timeout.as_millis()),
            format!("pool_size={}", self.pool.pool_size),
        ];
        if let Some(timeout) = self.pool.pool_timeout {
            params.push(format!("pool_timeout_ms={}", timeout.as_millis()));
        }
        if let Some(timeout) = self.pool.idle_timeout {
            params.push(format!("idle_timeout_ms={}", timeout.as_millis()));
        }
        if let Some(lifetime) = self.pool.max_lifetime {
            params.push(format!("max_lifetime_ms={}", lifetime.as_millis()));
        }
        if let Some(seed) = self.rng_seed {
            params.push(format!("seed={}", seed));
        }

        format!("{}{}?{}", URL_SCHEME, shards, params.join("&"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.addrs.is_empty() {
            return Err(ShardError::Config("at least one shard is required".into()));
        }

        for (name, addr) in &self.addrs {
            if name.trim().is_empty() {
                return Err(ShardError::Config("shard name cannot be empty".into()));
            }
            if addr.trim().is_empty() {
                return Err(ShardError::Config(format!(
                    "address of shard '{}' cannot be empty",
                    name
                )));
            }
        }

        if self.pool.pool_size == 0 {
            return Err(ShardError::Config("pool_size must be > 0".into()));
        }

        for (field, setting) in [
            ("min_retry_backoff", self.min_retry_backoff),
            ("max_retry_backoff", self.max_retry_backoff),
        ] {
            if !setting.is_whole_millis() {
                return Err(ShardError::Config(format!(
                    "{} {:?} must be a whole number of milliseconds",
                    field, setting
                )));
            }
        }

        if self.min_backoff() > self.max_backoff() {
            return Err(ShardError::Config(format!(
                "min_retry_backoff {:?} exceeds max_retry_backoff {:?}",
                self.min_backoff(),
                self.max_backoff()
            )));
        }

        Ok(())
    }
}

impl Default for RingOptions {
    fn default() -> Self {
        Self::new()
    }
}
