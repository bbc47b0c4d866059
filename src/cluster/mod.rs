pub mod command_info;
pub mod hashtag;
pub mod heartbeat;
pub mod registry;
pub mod ring;
pub mod shard;

pub use command_info::{CommandInfo, CommandInfoCache};
pub use heartbeat::{spawn_heartbeat, sweep_once};
pub use registry::ShardRegistry;
pub use ring::{DEFAULT_REPLICAS, HashRing};
pub use shard::{DOWN_THRESHOLD, Shard, ShardStatus};
