use crate::core::{Command, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::OnceCell;
use tracing::debug;

/// Key layout of one backend command, as reported by the backend's command table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    /// Negative arity means "at least |arity|" arguments including the name.
    pub arity: i32,
    /// Argument position of the first key, 0 when the command takes no key.
    pub first_key: usize,
    pub last_key: isize,
    pub step: usize,
    pub read_only: bool,
}

impl CommandInfo {
    pub fn new(name: &str, arity: i32, first_key: usize, last_key: isize, read_only: bool) -> Self {
        Self {
            name: name.to_string(),
            arity,
            first_key,
            last_key,
            step: usize::from(first_key > 0),
            read_only,
        }
    }

    /// Table of common commands, used when no shard can report its own.
    pub fn builtin_table() -> HashMap<String, CommandInfo> {
        [
            CommandInfo::new("ping", -1, 0, 0, false),
            CommandInfo::new("echo", 2, 0, 0, false),
            CommandInfo::new("dbsize", 1, 0, 0, true),
            CommandInfo::new("flushdb", -1, 0, 0, false),
            CommandInfo::new("info", -1, 0, 0, false),
            CommandInfo::new("time", 1, 0, 0, false),
            CommandInfo::new("get", 2, 1, 1, true),
            CommandInfo::new("set", -3, 1, 1, false),
            CommandInfo::new("del", -2, 1, -1, false),
            CommandInfo::new("exists", -2, 1, -1, true),
            CommandInfo::new("incr", 2, 1, 1, false),
            CommandInfo::new("incrby", 3, 1, 1, false),
            CommandInfo::new("decr", 2, 1, 1, false),
            CommandInfo::new("append", 3, 1, 1, false),
            CommandInfo::new("mget", -2, 1, -1, true),
            CommandInfo::new("expire", 3, 1, 1, false),
            CommandInfo::new("ttl", 2, 1, 1, true),
            CommandInfo::new("hget", 3, 1, 1, true),
            CommandInfo::new("hset", -4, 1, 1, false),
            CommandInfo::new("lpush", -3, 1, 1, false),
            CommandInfo::new("rpop", 2, 1, 1, false),
            CommandInfo::new("sadd", -3, 1, 1, false),
            CommandInfo::new("zadd", -4, 1, 1, false),
        ]
        .into_iter()
        .map(|info| (info.name.clone(), info))
        .collect()
    }
}

/// Argument position of the routing key of `cmd`, or 0 when it has none.
pub fn first_key_pos(cmd: &Command, info: Option<&CommandInfo>) -> usize {
    if let Some(pos) = cmd.key_pos_override() {
        return pos;
    }

    match cmd.name().as_str() {
        "eval" | "evalsha" => {
            if cmd.arg(2) != "0" {
                return 3;
            }
            return 0;
        }
        "publish" => return 1,
        _ => {}
    }

    info.map(|info| info.first_key).unwrap_or(0)
}

/// Routing key of `cmd` (before hash-tag extraction); empty when keyless.
pub fn first_key<'a>(cmd: &'a Command, info: Option<&CommandInfo>) -> &'a str {
    match first_key_pos(cmd, info) {
        0 => "",
        pos => cmd.arg(pos),
    }
}

/// Command table fetched once from the shards.
///
/// A failed load is retried on the next call; the first success is kept.
pub struct CommandInfoCache {
    cell: OnceCell<HashMap<String, CommandInfo>>,
    fallback: HashMap<String, CommandInfo>,
}

impl Default for CommandInfoCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandInfoCache {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            fallback: CommandInfo::builtin_table(),
        }
    }

    pub async fn get<F, Fut>(&self, load: F) -> Result<&HashMap<String, CommandInfo>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HashMap<String, CommandInfo>>>,
    {
        self.cell.get_or_try_init(load).await
    }

    /// Loaded table, or the built-in one when loading fails.
    pub async fn get_or_fallback<F, Fut>(&self, load: F) -> &HashMap<String, CommandInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HashMap<String, CommandInfo>>>,
    {
        match self.get(load).await {
            Ok(table) => table,
            Err(err) => {
                debug!(error = %err, "command info unavailable, using built-in table");
                &self.fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ShardError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_keyed_and_keyless_commands() {
        let table = CommandInfo::builtin_table();
        let get = Command::get("user:1");
        assert_eq!(first_key(&get, table.get("get")), "user:1");

        let ping = Command::ping();
        assert_eq!(first_key_pos(&ping, table.get("ping")), 0);
        assert_eq!(first_key(&ping, table.get("ping")), "");
    }

    #[test]
    fn test_unknown_command_is_keyless() {
        let cmd = Command::new(["custom", "arg"]);
        assert_eq!(first_key_pos(&cmd, None), 0);
    }

    #[test]
    fn test_eval_routes_by_first_script_key() {
        let with_keys = Command::new(["EVAL", "return 1", "1", "user:7"]);
        assert_eq!(first_key(&with_keys, None), "user:7");

        let no_keys = Command::new(["evalsha", "abc", "0"]);
        assert_eq!(first_key_pos(&no_keys, None), 0);
    }

    #[test]
    fn test_publish_routes_by_channel() {
        let cmd = Command::new(["publish", "news", "hello"]);
        assert_eq!(first_key(&cmd, None), "news");
    }

    #[test]
    fn test_override_wins() {
        let cmd = Command::new(["get", "a", "b"]).with_key_pos(2);
        let table = CommandInfo::builtin_table();
        assert_eq!(first_key(&cmd, table.get("get")), "b");
    }

    #[tokio::test]
    async fn test_cache_retries_until_success() {
        let cache = CommandInfoCache::new();
        let calls = AtomicUsize::new(0);

        let failed = cache
            .get(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ShardError::AllShardsDown)
            })
            .await;
        assert!(failed.is_err());

        for _ in 0..2 {
            let table = cache
                .get(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CommandInfo::builtin_table())
                })
                .await
                .unwrap();
            assert!(table.contains_key("get"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fallback_table() {
        let cache = CommandInfoCache::new();
        let table = cache
            .get_or_fallback(|| async { Err(ShardError::AllShardsDown) })
            .await;
        assert!(table.contains_key("set"));
    }
}
