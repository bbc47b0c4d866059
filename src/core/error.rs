use thiserror::Error;

/// Kind of transport-level failure reported by a [`ShardConn`](crate::connection::ShardConn).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Io,
    Timeout,
    Eof,
    Refused,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Io => "io",
            TransportKind::Timeout => "timeout",
            TransportKind::Eof => "eof",
            TransportKind::Refused => "refused",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("all ring shards are down")]
    AllShardsDown,

    #[error("ring is closed")]
    RegistryClosed,

    #[error("shard '{0}' not found")]
    ShardNotFound(String),

    /// The backend processed the request and replied with an error.
    #[error("{0}")]
    Backend(String),

    #[error("transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("connection pool timeout")]
    PoolTimeout,

    #[error("probe failed: {0}")]
    ProbeFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, ShardError>;

/// Reply prefixes that mark a backend as temporarily unable to serve.
const RETRYABLE_REPLY_MARKERS: &[&str] = &["LOADING ", "CLUSTERDOWN "];
const MAX_CLIENTS_REPLY: &str = "ERR max number of clients reached";

impl ShardError {
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// True when the backend itself produced the error reply.
    pub fn is_backend_error(&self) -> bool {
        matches!(self, ShardError::Backend(_))
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, ShardError::Transport { .. })
    }

    /// Classifies whether an operation that failed with this error may be retried.
    ///
    /// Network errors are retryable only when `retry_net_errors` is set.
    /// Backend replies are retryable only when they carry an overload marker.
    pub fn is_retryable(&self, retry_net_errors: bool) -> bool {
        match self {
            ShardError::Transport { .. } => retry_net_errors,
            ShardError::PoolTimeout => true,
            ShardError::Backend(message) => {
                message == MAX_CLIENTS_REPLY
                    || RETRYABLE_REPLY_MARKERS
                        .iter()
                        .any(|marker| message.starts_with(marker))
            }
            _ => false,
        }
    }

    /// True when a connection that produced this error must not go back to its pool.
    pub fn is_bad_conn(&self, allow_timeout: bool) -> bool {
        match self {
            ShardError::Backend(_) => false,
            ShardError::Transport {
                kind: TransportKind::Timeout,
                ..
            } => !allow_timeout,
            _ => true,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ShardError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for ShardError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => TransportKind::Timeout,
            std::io::ErrorKind::UnexpectedEof => TransportKind::Eof,
            std::io::ErrorKind::ConnectionRefused => TransportKind::Refused,
            _ => TransportKind::Io,
        };
        Self::transport(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_are_not_bad_connections() {
        let err = ShardError::Backend("WRONGTYPE Operation against a key".into());
        assert!(err.is_backend_error());
        assert!(!err.is_bad_conn(false));
        assert!(!err.is_retryable(true));
    }

    #[test]
    fn overload_markers_are_retryable() {
        assert!(ShardError::Backend("LOADING dataset in memory".into()).is_retryable(false));
        assert!(ShardError::Backend("CLUSTERDOWN hash slot not served".into()).is_retryable(false));
        assert!(ShardError::Backend(MAX_CLIENTS_REPLY.into()).is_retryable(false));
    }

    #[test]
    fn network_errors_follow_flag() {
        let err = ShardError::transport(TransportKind::Eof, "connection reset");
        assert!(err.is_network_error());
        assert!(err.is_retryable(true));
        assert!(!err.is_retryable(false));
    }

    #[test]
    fn timeouts_may_keep_connection() {
        let err = ShardError::transport(TransportKind::Timeout, "read timeout");
        assert!(!err.is_bad_conn(true));
        assert!(err.is_bad_conn(false));
    }

    #[test]
    fn io_errors_map_to_transport_kinds() {
        let err: ShardError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(
            err,
            ShardError::Transport {
                kind: TransportKind::Refused,
                ..
            }
        ));
    }
}
