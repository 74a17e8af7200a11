//! Lifecycle bookkeeping for a single install task.
//!
//! A task moves strictly forward:
//!
//! ```text
//! Unassigned -> Prepared -> Enqueued -> Applied -> Cleaned
//! ```
//!
//! `Cleaned` is only reached when the coordinator's cleanup step succeeded.

use std::fmt;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TaskState {
    #[default]
    Unassigned,
    Prepared,
    Enqueued,
    Applied,
    Cleaned,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Unassigned => "unassigned",
            TaskState::Prepared => "prepared",
            TaskState::Enqueued => "enqueued",
            TaskState::Applied => "applied",
            TaskState::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    state: TaskState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn require(&self, name: &str, expected: TaskState) -> Result<(), Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidTaskState {
                name: name.to_string(),
                expected,
                actual: self.state,
            })
        }
    }

    /// Move from `from` to `to`, failing if the task is anywhere else.
    pub fn advance(&mut self, name: &str, from: TaskState, to: TaskState) -> Result<(), Error> {
        self.require(name, from)?;
        self.state = to;
        Ok(())
    }
}
