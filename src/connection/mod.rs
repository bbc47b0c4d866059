pub mod config;
pub mod memory;
pub mod pool;

use crate::cluster::command_info::CommandInfo;
use crate::core::{Command, Reply, Result, ShardError};
use async_trait::async_trait;
use config::RingOptions;
use std::collections::HashMap;

/// How far a failed dispatch got before the transport gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Nothing reached the backend; the sub-batch can be replayed safely.
    NotSent,
    /// Some or all of the sub-batch may have been applied.
    PartiallySent,
}

/// Failure of a whole sub-batch dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct SendFailure {
    pub error: ShardError,
    pub phase: DispatchPhase,
}

impl SendFailure {
    pub fn not_sent(error: ShardError) -> Self {
        Self {
            error,
            phase: DispatchPhase::NotSent,
        }
    }

    pub fn partially_sent(error: ShardError) -> Self {
        Self {
            error,
            phase: DispatchPhase::PartiallySent,
        }
    }

    /// True when replaying the sub-batch cannot double-apply anything.
    pub fn can_retry(&self) -> bool {
        self.phase == DispatchPhase::NotSent && self.error.is_retryable(true)
    }
}

/// One open connection to a shard backend.
///
/// Results are positional: `send` returns exactly one entry per command.
#[async_trait]
pub trait ShardConn: Send {
    /// Sends a sub-batch and reads one reply per command.
    ///
    /// Backend error replies are per-command `Err` entries; only transport
    /// failures fail the whole call.
    async fn send(
        &mut self,
        cmds: &[Command],
    ) -> std::result::Result<Vec<Result<Reply>>, SendFailure>;

    /// Liveness probe.
    async fn ping(&mut self) -> Result<()>;

    /// Connection saw a transport error and must not be reused.
    fn is_broken(&self) -> bool {
        false
    }
}

/// Connection factory for shard backends.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dials `addr` honouring the ring's dial/read/write timeouts.
    async fn connect(&self, addr: &str, opt: &RingOptions) -> Result<Box<dyn ShardConn>>;

    /// Fetches the backend's command table.
    async fn command_info(
        &self,
        _addr: &str,
        _opt: &RingOptions,
    ) -> Result<HashMap<String, CommandInfo>> {
        Err(ShardError::ExecutionError(
            "transport does not expose command info".to_string(),
        ))
    }
}
