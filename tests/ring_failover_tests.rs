/// Failover tests
///
/// Shards going down and coming back while the ring serves traffic
/// Run with: cargo test --test ring_failover_tests
use shardring::{
    BackoffSetting, Command, InMemoryBackend, InMemoryTransport, Reply, Ring, RingOptions,
    ShardError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Cluster {
    ring: Ring,
    backends: HashMap<String, Arc<InMemoryBackend>>,
}

impl Cluster {
    fn start(names: &[&str], heartbeat: Duration) -> Self {
        let transport = InMemoryTransport::new();
        let mut options = RingOptions::new()
            .heartbeat_frequency(heartbeat)
            .max_retries(1)
            .min_retry_backoff(BackoffSetting::Disabled)
            .max_retry_backoff(BackoffSetting::Disabled)
            .rng_seed(7);
        let mut backends = HashMap::new();
        for name in names {
            let addr = format!("mem:{name}");
            backends.insert(name.to_string(), transport.add_backend(&addr));
            options = options.shard(name, &addr);
        }
        let ring = Ring::new(options, Arc::new(transport)).unwrap();
        Self { ring, backends }
    }

    fn owners(&self, keys: &[String]) -> Vec<String> {
        keys.iter()
            .map(|key| self.ring.shard_for_key(key).unwrap())
            .collect()
    }
}

fn sample_keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("session:{i}")).collect()
}

#[tokio::test]
async fn test_down_shard_leaves_after_three_sweeps() {
    let cluster = Cluster::start(&["a", "b", "c"], Duration::from_secs(60));
    cluster.backends["b"].set_reachable(false);

    assert!(!cluster.ring.check_health().await);
    assert!(!cluster.ring.check_health().await);
    assert!(cluster.ring.check_health().await);

    let statuses = cluster.ring.shards();
    let b = statuses.iter().find(|s| s.name == "b").unwrap();
    assert!(!b.up);
    assert_eq!(b.failures, 3);

    for owner in cluster.owners(&sample_keys(500)) {
        assert_ne!(owner, "b");
    }
    cluster.ring.close().await.unwrap();
}

#[tokio::test]
async fn test_only_failed_shards_keys_move() {
    let cluster = Cluster::start(&["a", "b", "c", "d"], Duration::from_secs(60));
    let keys = sample_keys(5_000);
    let before = cluster.owners(&keys);

    cluster.backends["c"].set_reachable(false);
    for _ in 0..3 {
        cluster.ring.check_health().await;
    }
    let after = cluster.owners(&keys);

    for ((key, old), new) in keys.iter().zip(&before).zip(&after) {
        if old == "c" {
            assert_ne!(new, "c");
        } else {
            assert_eq!(old, new, "{key} moved although its shard stayed up");
        }
    }
    cluster.ring.close().await.unwrap();
}

#[tokio::test]
async fn test_recovered_shard_gets_its_keys_back() {
    let cluster = Cluster::start(&["a", "b", "c"], Duration::from_secs(60));
    let keys = sample_keys(1_000);
    let before = cluster.owners(&keys);

    cluster.backends["a"].set_reachable(false);
    for _ in 0..3 {
        cluster.ring.check_health().await;
    }
    cluster.backends["a"].set_reachable(true);
    assert!(cluster.ring.check_health().await);

    assert_eq!(cluster.owners(&keys), before);
    cluster.ring.close().await.unwrap();
}

#[tokio::test]
async fn test_writes_reroute_around_down_shard() {
    let cluster = Cluster::start(&["a", "b", "c"], Duration::from_secs(60));
    cluster.backends["a"].set_reachable(false);
    for _ in 0..3 {
        cluster.ring.check_health().await;
    }

    let mut cmds = sample_keys(200)
        .into_iter()
        .map(|key| Command::set(key, "v"))
        .collect::<Vec<_>>();
    cluster.ring.execute(&mut cmds).await.unwrap();

    assert!(cluster.backends["a"].is_empty());
    assert_eq!(
        cluster.backends["b"].len() + cluster.backends["c"].len(),
        200
    );
    cluster.ring.close().await.unwrap();
}

#[tokio::test]
async fn test_all_shards_down() {
    let cluster = Cluster::start(&["a", "b"], Duration::from_secs(60));
    for backend in cluster.backends.values() {
        backend.set_reachable(false);
    }
    for _ in 0..3 {
        cluster.ring.check_health().await;
    }

    assert!(matches!(
        cluster.ring.resolve("anything"),
        Err(ShardError::AllShardsDown)
    ));

    let mut cmds = vec![Command::get("x"), Command::ping(), Command::set("y", "1")];
    let err = cluster.ring.execute(&mut cmds).await.unwrap_err();
    assert_eq!(err, ShardError::AllShardsDown);
    assert!(cmds.iter().all(|cmd| cmd.err() == Some(&ShardError::AllShardsDown)));

    let single = cluster.ring.process(&mut Command::ping()).await;
    assert_eq!(single, Err(ShardError::AllShardsDown));

    cluster.ring.close().await.unwrap();
}

#[tokio::test]
async fn test_unrouted_failure_before_heartbeat_notices() {
    let cluster = Cluster::start(&["a", "b"], Duration::from_secs(60));
    let owner = cluster.ring.shard_for_key("cart:1").unwrap();
    cluster.backends[&owner].set_reachable(false);

    // The ring still routes to the unreachable shard until the heartbeat votes it out.
    let err = cluster
        .ring
        .process(&mut Command::set("cart:1", "x"))
        .await
        .unwrap_err();
    assert!(err.is_network_error());

    for _ in 0..3 {
        cluster.ring.check_health().await;
    }
    let reply = cluster
        .ring
        .process(&mut Command::set("cart:1", "x"))
        .await
        .unwrap();
    assert_eq!(reply, Reply::ok());
    cluster.ring.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_background_heartbeat_reacts() {
    let cluster = Cluster::start(&["a", "b"], Duration::from_millis(500));
    cluster.backends["a"].set_reachable(false);

    tokio::time::sleep(Duration::from_millis(1_600)).await;
    assert!(cluster.ring.shards().iter().any(|s| s.name == "a" && !s.up));

    cluster.backends["a"].set_reachable(true);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(cluster.ring.shards().iter().all(|s| s.up));

    cluster.ring.close().await.unwrap();
}
