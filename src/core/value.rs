use serde::{Deserialize, Serialize};
use std::fmt;

/// A reply value returned by a shard backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Nil,
    Status(String),
    Integer(i64),
    Bulk(String),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Status(s) | Reply::Bulk(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            Reply::Bulk(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Nil => write!(f, "(nil)"),
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(s) => write!(f, "\"{}\"", s),
            Reply::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}
