use super::error::Result;
use super::value::Reply;
use std::fmt;

/// A single logical request routed to one shard.
///
/// `args[0]` is the command name; the remaining entries are its arguments.
/// The result slot is filled by whichever path dispatches the command.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    args: Vec<String>,
    key_pos: Option<usize>,
    result: Option<Result<Reply>>,
}

impl Command {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            key_pos: None,
            result: None,
        }
    }

    /// Forces the argument position used as routing key; `0` means keyless.
    pub fn with_key_pos(mut self, pos: usize) -> Self {
        self.key_pos = Some(pos);
        self
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(["get".to_string(), key.into()])
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(["set".to_string(), key.into(), value.into()])
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::new(["del".to_string(), key.into()])
    }

    pub fn incr(key: impl Into<String>) -> Self {
        Self::new(["incr".to_string(), key.into()])
    }

    pub fn ping() -> Self {
        Self::new(["ping"])
    }

    /// Lowercased command name.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|name| name.to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Argument at `pos`, or an empty string when out of range.
    pub fn arg(&self, pos: usize) -> &str {
        self.args.get(pos).map(String::as_str).unwrap_or("")
    }

    pub fn key_pos_override(&self) -> Option<usize> {
        self.key_pos
    }

    pub fn result(&self) -> Option<&Result<Reply>> {
        self.result.as_ref()
    }

    pub fn reply(&self) -> Option<&Reply> {
        self.result.as_ref().and_then(|r| r.as_ref().ok())
    }

    pub fn err(&self) -> Option<&super::ShardError> {
        self.result.as_ref().and_then(|r| r.as_ref().err())
    }

    pub(crate) fn set_result(&mut self, result: Result<Reply>) {
        self.result = Some(result);
    }

    pub(crate) fn set_err(&mut self, err: super::ShardError) {
        self.result = Some(Err(err));
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args.join(" "))?;
        match &self.result {
            Some(Ok(reply)) => write!(f, ": {}", reply),
            Some(Err(err)) => write!(f, ": {}", err),
            None => Ok(()),
        }
    }
}

/// Stamps `err` on every command of a sub-batch.
pub(crate) fn set_cmds_err(cmds: &mut [Command], err: &super::ShardError) {
    for cmd in cmds {
        cmd.set_err(err.clone());
    }
}

/// First error carried by the commands, in submission order.
pub fn first_cmds_err(cmds: &[Command]) -> Option<super::ShardError> {
    cmds.iter().find_map(|cmd| cmd.err().cloned())
}
