use super::backoff::retry_backoff;
use crate::cluster::command_info::{CommandInfo, first_key};
use crate::cluster::hashtag;
use crate::cluster::registry::ShardRegistry;
use crate::cluster::shard::Shard;
use crate::connection::config::RingOptions;
use crate::core::types::set_cmds_err;
use crate::core::{Command, Reply, Result, ShardError, first_cmds_err};
use rand::rngs::StdRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Command indexes grouped by owning shard name; `""` is the any-shard group.
type Groups = BTreeMap<String, Vec<usize>>;

/// Runs commands against the ring, splitting batches per shard and retrying
/// failures that are known not to have reached the backend.
pub struct BatchExecutor {
    registry: Arc<ShardRegistry>,
    opt: Arc<RingOptions>,
}

impl BatchExecutor {
    pub fn new(registry: Arc<ShardRegistry>, opt: Arc<RingOptions>) -> Self {
        Self { registry, opt }
    }

    /// Executes `cmds` as one logical batch.
    ///
    /// Every command ends up with a result. Returns the first command error
    /// in submission order, if any.
    pub async fn execute(
        &self,
        cmds: &mut [Command],
        table: &HashMap<String, CommandInfo>,
        rng: &mut StdRng,
    ) -> Result<()> {
        if self.registry.is_closed() {
            set_cmds_err(cmds, &ShardError::RegistryClosed);
            return Err(ShardError::RegistryClosed);
        }
        if cmds.is_empty() {
            return Ok(());
        }

        let mut groups = self.partition(cmds, 0..cmds.len(), table);
        for attempt in 0..=self.opt.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt, rng);
                debug!(attempt, groups = groups.len(), ?delay, "retrying batch");
                tokio::time::sleep(delay).await;
            }

            let mut retry = Vec::new();
            for (name, idxs) in &groups {
                if self.dispatch(name, idxs, cmds, rng).await {
                    retry.extend_from_slice(idxs);
                }
            }
            if retry.is_empty() {
                break;
            }

            retry.sort_unstable();
            groups = self.partition(cmds, retry, table);
        }

        match first_cmds_err(cmds) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Executes a single command, retrying transient failures.
    ///
    /// Besides unsent transport failures, backend replies that signal a
    /// temporary condition (loading, too many clients) are retried too.
    pub async fn process(
        &self,
        cmd: &mut Command,
        table: &HashMap<String, CommandInfo>,
        rng: &mut StdRng,
    ) -> Result<Reply> {
        let key = first_key(cmd, table.get(&cmd.name())).to_string();
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt, rng)).await;
            }

            let resolved = if key.is_empty() {
                self.registry.random(rng)
            } else {
                self.registry.resolve_by_key(&key)
            };
            let shard = match resolved {
                Ok(shard) => shard,
                Err(err) => {
                    cmd.set_err(err.clone());
                    return Err(err);
                }
            };

            match self.process_once(&shard, cmd).await {
                Ok(reply) => {
                    cmd.set_result(Ok(reply.clone()));
                    return Ok(reply);
                }
                Err((err, retryable)) if retryable && attempt < self.opt.max_retries => {
                    debug!(attempt, shard = %shard.name(), error = %err, "retrying command");
                    attempt += 1;
                }
                Err((err, _)) => {
                    cmd.set_err(err.clone());
                    return Err(err);
                }
            }
        }
    }

    async fn process_once(
        &self,
        shard: &Shard,
        cmd: &Command,
    ) -> std::result::Result<Reply, (ShardError, bool)> {
        let mut conn = match shard.pool().get().await {
            Ok(conn) => conn,
            Err(err) => {
                let retryable = err.is_retryable(true);
                return Err((err, retryable));
            }
        };

        let sent = conn.connection().send(std::slice::from_ref(cmd)).await;
        match sent {
            Ok(results) => {
                conn.put().await;
                match results.into_iter().next() {
                    Some(Ok(reply)) => Ok(reply),
                    Some(Err(err)) => {
                        let retryable = err.is_retryable(false);
                        Err((err, retryable))
                    }
                    None => Err((missing_reply(), false)),
                }
            }
            Err(failure) => {
                conn.discard();
                let retryable = failure.can_retry();
                Err((failure.error, retryable))
            }
        }
    }

    /// Groups commands by the shard currently owning their routing key.
    fn partition(
        &self,
        cmds: &[Command],
        idxs: impl IntoIterator<Item = usize>,
        table: &HashMap<String, CommandInfo>,
    ) -> Groups {
        let mut groups = Groups::new();
        for i in idxs {
            let cmd = &cmds[i];
            let key = first_key(cmd, table.get(&cmd.name()));
            let name = if key.is_empty() {
                String::new()
            } else {
                self.registry.hash(hashtag::key(key)).unwrap_or_default()
            };
            groups.entry(name).or_default().push(i);
        }
        groups
    }

    /// Sends one shard's sub-batch. Returns whether it should be retried.
    async fn dispatch(
        &self,
        name: &str,
        idxs: &[usize],
        cmds: &mut [Command],
        rng: &mut StdRng,
    ) -> bool {
        let shard = match self.registry.resolve_by_name(name, rng) {
            Ok(shard) => shard,
            Err(err) => {
                stamp(cmds, idxs, &err);
                return false;
            }
        };

        let mut conn = match shard.pool().get().await {
            Ok(conn) => conn,
            Err(err) => {
                // Nothing was sent yet
                let retryable = err.is_retryable(true);
                debug!(shard = %shard.name(), error = %err, retryable, "connection checkout failed");
                stamp(cmds, idxs, &err);
                return retryable;
            }
        };

        let batch = idxs.iter().map(|&i| cmds[i].clone()).collect::<Vec<_>>();
        let sent = conn.connection().send(&batch).await;
        match sent {
            Ok(results) => {
                conn.put().await;
                let mut results = results.into_iter();
                for &i in idxs {
                    let result = results.next().unwrap_or_else(|| Err(missing_reply()));
                    cmds[i].set_result(result);
                }
                false
            }
            Err(failure) => {
                conn.discard();
                let retryable = failure.can_retry();
                warn!(
                    shard = %shard.name(),
                    commands = idxs.len(),
                    phase = ?failure.phase,
                    error = %failure.error,
                    retryable,
                    "sub-batch dispatch failed"
                );
                stamp(cmds, idxs, &failure.error);
                retryable
            }
        }
    }

    fn backoff(&self, attempt: usize, rng: &mut StdRng) -> std::time::Duration {
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
        retry_backoff(attempt, self.opt.min_backoff(), self.opt.max_backoff(), rng)
    }
}

fn stamp(cmds: &mut [Command], idxs: &[usize], err: &ShardError) {
    for &i in idxs {
        cmds[i].set_err(err.clone());
    }
}

fn missing_reply() -> ShardError {
    ShardError::ExecutionError("backend returned fewer replies than commands".to_string())
}
