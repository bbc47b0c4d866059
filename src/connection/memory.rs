use super::{DispatchPhase, SendFailure, ShardConn, Transport, config::RingOptions};
use crate::cluster::command_info::CommandInfo;
use crate::core::{Command, Reply, Result, ShardError, TransportKind};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// An in-process key/value backend standing in for one shard server.
///
/// Faults can be injected to exercise the ring's failover paths.
#[derive(Default)]
pub struct InMemoryBackend {
    data: Mutex<HashMap<String, String>>,
    unreachable: AtomicBool,
    injected_failures: Mutex<VecDeque<DispatchPhase>>,
    connects: AtomicUsize,
    dispatches: AtomicUsize,
    pings: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new connections and fail every request on open ones.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }

    /// Fail the next `count` sub-batch dispatches in the given phase.
    ///
    /// A `PartiallySent` failure applies the first half of the sub-batch before failing.
    pub fn fail_next_sends(&self, count: usize, phase: DispatchPhase) {
        if let Ok(mut failures) = self.injected_failures.lock() {
            failures.extend(std::iter::repeat_n(phase, count));
        }
    }

    /// Successful and failed dispatches received so far.
    pub fn dispatches(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.data.lock().ok().and_then(|data| data.get(key).cloned())
    }

    pub fn len(&self) -> usize {
        self.data.lock().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_injected_failure(&self) -> Option<DispatchPhase> {
        self.injected_failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.pop_front())
    }

    fn apply(&self, cmd: &Command) -> Result<Reply> {
        let mut data = self.data.lock()?;
        let args = cmd.args();
        let name = cmd.name();
        let arity_err = || {
            ShardError::Backend(format!(
                "ERR wrong number of arguments for '{}' command",
                name
            ))
        };
        let not_integer =
            || ShardError::Backend("ERR value is not an integer or out of range".to_string());

        match name.as_str() {
            "ping" => match args.get(1) {
                Some(msg) => Ok(Reply::Bulk(msg.clone())),
                None => Ok(Reply::Status("PONG".to_string())),
            },
            "echo" => args.get(1).map(|m| Reply::Bulk(m.clone())).ok_or_else(arity_err),
            "get" => {
                let key = args.get(1).ok_or_else(arity_err)?;
                Ok(data.get(key).cloned().map(Reply::Bulk).unwrap_or(Reply::Nil))
            }
            "set" => {
                if args.len() < 3 {
                    return Err(arity_err());
                }
                data.insert(args[1].clone(), args[2].clone());
                Ok(Reply::ok())
            }
            "del" | "exists" => {
                if args.len() < 2 {
                    return Err(arity_err());
                }
                let mut count = 0;
                for key in &args[1..] {
                    let hit = if name == "del" {
                        data.remove(key).is_some()
                    } else {
                        data.contains_key(key)
                    };
                    if hit {
                        count += 1;
                    }
                }
                Ok(Reply::Integer(count))
            }
            "incr" | "incrby" => {
                let key = args.get(1).ok_or_else(arity_err)?;
                let delta = if name == "incrby" {
                    args.get(2)
                        .ok_or_else(arity_err)?
                        .parse::<i64>()
                        .map_err(|_| not_integer())?
                } else {
                    1
                };
                let current = match data.get(key) {
                    Some(v) => v.parse::<i64>().map_err(|_| not_integer())?,
                    None => 0,
                };
                let next = current.checked_add(delta).ok_or_else(not_integer)?;
                data.insert(key.clone(), next.to_string());
                Ok(Reply::Integer(next))
            }
            "append" => {
                if args.len() < 3 {
                    return Err(arity_err());
                }
                let entry = data.entry(args[1].clone()).or_default();
                entry.push_str(&args[2]);
                Ok(Reply::Integer(entry.len() as i64))
            }
            "mget" => {
                if args.len() < 2 {
                    return Err(arity_err());
                }
                Ok(Reply::Array(
                    args[1..]
                        .iter()
                        .map(|key| data.get(key).cloned().map(Reply::Bulk).unwrap_or(Reply::Nil))
                        .collect(),
                ))
            }
            "dbsize" => Ok(Reply::Integer(data.len() as i64)),
            "flushdb" => {
                data.clear();
                Ok(Reply::ok())
            }
            other => Err(ShardError::Backend(format!(
                "ERR unknown command '{}'",
                other
            ))),
        }
    }
}

/// Transport that connects to [`InMemoryBackend`]s by address.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    backends: Arc<Mutex<HashMap<String, Arc<InMemoryBackend>>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend at `addr`, replacing any previous one.
    pub fn add_backend(&self, addr: &str) -> Arc<InMemoryBackend> {
        let backend = Arc::new(InMemoryBackend::new());
        if let Ok(mut backends) = self.backends.lock() {
            backends.insert(addr.to_string(), Arc::clone(&backend));
        }
        backend
    }

    pub fn backend(&self, addr: &str) -> Option<Arc<InMemoryBackend>> {
        self.backends
            .lock()
            .ok()
            .and_then(|backends| backends.get(addr).cloned())
    }

    fn reachable_backend(&self, addr: &str) -> Result<Arc<InMemoryBackend>> {
        match self.backend(addr) {
            Some(backend) if backend.is_reachable() => Ok(backend),
            _ => Err(ShardError::transport(
                TransportKind::Refused,
                format!("dial {}: connection refused", addr),
            )),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self, addr: &str, _opt: &RingOptions) -> Result<Box<dyn ShardConn>> {
        let backend = self.reachable_backend(addr)?;
        backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryConn {
            backend,
            broken: false,
        }))
    }

    async fn command_info(
        &self,
        addr: &str,
        _opt: &RingOptions,
    ) -> Result<HashMap<String, CommandInfo>> {
        self.reachable_backend(addr)?;
        Ok(CommandInfo::builtin_table())
    }
}

struct InMemoryConn {
    backend: Arc<InMemoryBackend>,
    broken: bool,
}

impl InMemoryConn {
    fn fail(&mut self, error: ShardError, phase: DispatchPhase) -> SendFailure {
        self.broken = true;
        SendFailure { error, phase }
    }
}

#[async_trait]
impl ShardConn for InMemoryConn {
    async fn send(
        &mut self,
        cmds: &[Command],
    ) -> std::result::Result<Vec<Result<Reply>>, SendFailure> {
        if self.broken {
            return Err(SendFailure::not_sent(ShardError::transport(
                TransportKind::Io,
                "use of broken connection",
            )));
        }
        if !self.backend.is_reachable() {
            return Err(self.fail(
                ShardError::transport(TransportKind::Io, "connection reset by peer"),
                DispatchPhase::NotSent,
            ));
        }

        self.backend.dispatches.fetch_add(1, Ordering::SeqCst);

        match self.backend.next_injected_failure() {
            Some(DispatchPhase::NotSent) => Err(self.fail(
                ShardError::transport(TransportKind::Io, "write: broken pipe"),
                DispatchPhase::NotSent,
            )),
            Some(DispatchPhase::PartiallySent) => {
                for cmd in &cmds[..cmds.len() / 2] {
                    let _ = self.backend.apply(cmd);
                }
                Err(self.fail(
                    ShardError::transport(TransportKind::Eof, "read: unexpected EOF"),
                    DispatchPhase::PartiallySent,
                ))
            }
            None => Ok(cmds.iter().map(|cmd| self.backend.apply(cmd)).collect()),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.backend.pings.fetch_add(1, Ordering::SeqCst);
        if !self.backend.is_reachable() {
            self.broken = true;
            return Err(ShardError::transport(
                TransportKind::Timeout,
                "ping: i/o timeout",
            ));
        }
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(transport: &InMemoryTransport, addr: &str) -> Box<dyn ShardConn> {
        transport.connect(addr, &RingOptions::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_send_is_positional() {
        let transport = InMemoryTransport::new();
        let backend = transport.add_backend("mem:1");
        let mut conn = connect(&transport, "mem:1").await;

        let cmds = vec![
            Command::set("k", "1"),
            Command::incr("k"),
            Command::get("k"),
            Command::new(["bogus"]),
        ];
        let results = conn.send(&cmds).await.unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(results[1], Ok(Reply::Integer(2)));
        assert_eq!(results[2], Ok(Reply::Bulk("2".into())));
        assert!(results[3].as_ref().unwrap_err().is_backend_error());
        assert_eq!(backend.dispatches(), 1);
    }

    #[tokio::test]
    async fn test_injected_partial_failure_applies_prefix() {
        let transport = InMemoryTransport::new();
        let backend = transport.add_backend("mem:1");
        backend.fail_next_sends(1, DispatchPhase::PartiallySent);
        let mut conn = connect(&transport, "mem:1").await;

        let cmds = vec![Command::set("a", "1"), Command::set("b", "2")];
        let failure = conn.send(&cmds).await.unwrap_err();

        assert_eq!(failure.phase, DispatchPhase::PartiallySent);
        assert!(!failure.can_retry());
        assert!(conn.is_broken());
        assert_eq!(backend.value("a"), Some("1".into()));
        assert_eq!(backend.value("b"), None);
    }

    #[tokio::test]
    async fn test_unreachable_backend_refuses_dial() {
        let transport = InMemoryTransport::new();
        let backend = transport.add_backend("mem:1");
        backend.set_reachable(false);

        let result = transport.connect("mem:1", &RingOptions::new()).await;
        assert!(matches!(
            result,
            Err(ShardError::Transport {
                kind: TransportKind::Refused,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let transport = InMemoryTransport::new();
        transport.add_backend("mem:1");
        let mut conn = connect(&transport, "mem:1").await;

        let results = conn
            .send(&[Command::set("k", "abc"), Command::incr("k")])
            .await
            .unwrap();
        assert_eq!(
            results[1],
            Err(ShardError::Backend(
                "ERR value is not an integer or out of range".into()
            ))
        );
    }
}
