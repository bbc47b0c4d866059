use crate::cluster::registry::ShardRegistry;
use crate::cluster::shard::Shard;
use crate::core::{Result, ShardError};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Runs `f` concurrently on every shard that is currently up.
///
/// Waits for all tasks and returns the first error observed; later errors
/// are dropped.
pub async fn for_each_live_shard<F, Fut>(registry: &ShardRegistry, f: F) -> Result<()>
where
    F: Fn(Arc<Shard>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if registry.is_closed() {
        return Err(ShardError::RegistryClosed);
    }

    let mut tasks = registry
        .live()
        .into_iter()
        .map(|shard| tokio::spawn(f(shard)))
        .collect::<FuturesUnordered<_>>();

    let mut first_err = None;
    while let Some(joined) = tasks.next().await {
        let result = joined.unwrap_or_else(|err| {
            Err(ShardError::ExecutionError(format!("shard task failed: {err}")))
        });
        if let Err(err) = result {
            warn!(error = %err, "shard task failed");
            first_err.get_or_insert(err);
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
