/// Ring API tests
///
/// Tests for the high-level Ring API over in-memory shards
/// Run with: cargo test --test client_api_tests
use shardring::{
    BackoffSetting, Command, DispatchPhase, InMemoryTransport, Reply, Ring, RingOptions,
    ShardError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn three_shard_ring() -> (Ring, InMemoryTransport) {
    let transport = InMemoryTransport::new();
    let mut options = RingOptions::new()
        .heartbeat_frequency(Duration::from_secs(60))
        .max_retries(2)
        .min_retry_backoff(BackoffSetting::Disabled)
        .max_retry_backoff(BackoffSetting::Disabled)
        .rng_seed(42);
    for name in ["a", "b", "c"] {
        let addr = format!("mem:{name}");
        transport.add_backend(&addr);
        options = options.shard(name, &addr);
    }
    let ring = Ring::new(options, Arc::new(transport.clone())).unwrap();
    (ring, transport)
}

#[tokio::test]
async fn test_ring_set_and_get() {
    let (ring, transport) = three_shard_ring();

    ring.process(&mut Command::set("user:1", "alice")).await.unwrap();
    let reply = ring.process(&mut Command::get("user:1")).await.unwrap();
    assert_eq!(reply, Reply::Bulk("alice".into()));

    let owner = ring.shard_for_key("user:1").unwrap();
    let backend = transport.backend(&format!("mem:{owner}")).unwrap();
    assert_eq!(backend.value("user:1").as_deref(), Some("alice"));

    ring.close().await.unwrap();
}

#[tokio::test]
async fn test_ring_from_url() {
    let transport = InMemoryTransport::new();
    transport.add_backend("mem:1");
    transport.add_backend("mem:2");

    let ring = Ring::from_url(
        "ring://a=mem:1,b=mem:2?heartbeat_ms=250&max_retries=1",
        Arc::new(transport),
    )
    .unwrap();

    assert_eq!(ring.options().addrs.len(), 2);
    assert_eq!(ring.options().heartbeat_frequency.as_millis(), 250);
    assert_eq!(ring.shards().len(), 2);
    ring.close().await.unwrap();
}

#[tokio::test]
async fn test_ring_rejects_empty_options() {
    let result = Ring::new(RingOptions::new(), Arc::new(InMemoryTransport::new()));
    assert!(matches!(result, Err(ShardError::Config(_))));
}

#[tokio::test]
async fn test_batch_spans_every_shard() {
    let (ring, transport) = three_shard_ring();

    let mut cmds = (0..300)
        .map(|i| Command::set(format!("key:{i}"), i.to_string()))
        .collect::<Vec<_>>();
    ring.execute(&mut cmds).await.unwrap();

    let stored: usize = ["a", "b", "c"]
        .iter()
        .map(|name| transport.backend(&format!("mem:{name}")).unwrap().len())
        .sum();
    assert_eq!(stored, 300);
    for name in ["a", "b", "c"] {
        let backend = transport.backend(&format!("mem:{name}")).unwrap();
        assert!(!backend.is_empty(), "shard {name} received no keys");
        assert_eq!(backend.dispatches(), 1);
    }

    ring.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_recovers_from_transient_failure() {
    let (ring, transport) = three_shard_ring();

    let owner = ring.shard_for_key("order:9").unwrap();
    let flaky = transport.backend(&format!("mem:{owner}")).unwrap();
    flaky.fail_next_sends(1, DispatchPhase::NotSent);

    let mut cmds = (0..60)
        .map(|i| Command::set(format!("order:{i}"), "paid"))
        .collect::<Vec<_>>();
    let result = ring.execute(&mut cmds).await;

    assert!(result.is_ok());
    assert!(cmds.iter().all(|cmd| cmd.reply() == Some(&Reply::ok())));
    assert_eq!(flaky.dispatches(), 2);
    assert_eq!(flaky.value("order:9").as_deref(), Some("paid"));

    ring.close().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_reports_first_error() {
    let (ring, _) = three_shard_ring();

    let mut pipe = ring.pipeline();
    pipe.push(Command::set("name", "bob"))
        .push(Command::incr("name"))
        .push(Command::new(["frobnicate", "x"]).with_key_pos(1));
    assert_eq!(pipe.len(), 3);

    let result = pipe.exec().await;
    assert!(!result.is_ok());
    assert_eq!(result.cmds[0].reply(), Some(&Reply::ok()));
    assert!(matches!(result.error, Some(ShardError::Backend(ref msg)) if msg.contains("not an integer")));
    assert!(result.cmds[2].err().is_some());

    ring.close().await.unwrap();
}

#[tokio::test]
async fn test_for_each_live_shard() {
    let (ring, transport) = three_shard_ring();
    ring.execute(&mut [Command::set("a1", "1"), Command::set("b1", "1")])
        .await
        .unwrap();

    let visited = Arc::new(AtomicUsize::new(0));
    ring.for_each_live_shard(|shard| {
        let visited = Arc::clone(&visited);
        async move {
            let mut conn = shard.pool().get().await?;
            conn.connection().send(&[Command::new(["flushdb"])]).await.map_err(|f| f.error)?;
            conn.put().await;
            visited.fetch_add(1, Ordering::SeqCst);
            Ok::<(), ShardError>(())
        }
    })
    .await
    .unwrap();

    assert_eq!(visited.load(Ordering::SeqCst), 3);
    for name in ["a", "b", "c"] {
        assert!(transport.backend(&format!("mem:{name}")).unwrap().is_empty());
    }

    ring.close().await.unwrap();
}

#[tokio::test]
async fn test_pool_stats() {
    let (ring, _) = three_shard_ring();
    for i in 0..20 {
        ring.process(&mut Command::set(format!("k{i}"), "v")).await.unwrap();
    }

    let stats = ring.pool_stats().await;
    assert_eq!(stats.hits + stats.misses, 20);
    assert_eq!(stats.timeouts, 0);
    assert!(stats.total_conns <= 3);

    ring.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_terminal() {
    let (ring, _) = three_shard_ring();
    ring.close().await.unwrap();

    assert!(matches!(ring.resolve("k"), Err(ShardError::RegistryClosed)));
    let mut cmds = [Command::get("k")];
    assert_eq!(ring.execute(&mut cmds).await, Err(ShardError::RegistryClosed));
    assert_eq!(ring.execute(&mut []).await, Err(ShardError::RegistryClosed));
    assert!(ring.shards().is_empty());

    ring.close().await.unwrap();
}
