pub mod error;
pub mod types;
pub mod value;

pub use error::{Result, ShardError, TransportKind};
pub use types::{Command, first_cmds_err};
pub use value::Reply;
