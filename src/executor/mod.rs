pub mod backoff;
pub mod batch;
pub mod fanout;
pub mod pipeline;

pub use backoff::retry_backoff;
pub use batch::BatchExecutor;
pub use fanout::for_each_live_shard;
pub use pipeline::{BatchResult, Pipeline};
