use crate::Ring;
use crate::core::{Command, ShardError};

/// Commands queued for one batched round trip through a [`Ring`].
pub struct Pipeline<'a> {
    ring: &'a Ring,
    cmds: Vec<Command>,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(ring: &'a Ring) -> Self {
        Self {
            ring,
            cmds: Vec::new(),
        }
    }

    /// Queue a command
    pub fn push(&mut self, cmd: Command) -> &mut Self {
        self.cmds.push(cmd);
        self
    }

    /// Queue a command given as arguments
    pub fn cmd<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Command::new(args))
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    /// Drop every queued command
    pub fn discard(&mut self) {
        self.cmds.clear();
    }

    /// Execute the queued commands
    pub async fn exec(self) -> BatchResult {
        let mut cmds = self.cmds;
        let error = self.ring.execute(&mut cmds).await.err();
        BatchResult { cmds, error }
    }
}

/// Outcome of a pipeline: every command with its result, plus the first
/// command error in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub cmds: Vec<Command>,
    pub error: Option<ShardError>,
}

impl BatchResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Commands, or the first error when any command failed
    pub fn into_result(self) -> crate::core::Result<Vec<Command>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.cmds),
        }
    }
}
