use std::borrow::Cow;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::usage::UseId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub(crate) u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Work,
    /// Evaluates a condition, then schedules the chosen branch.
    Conditional,
    /// Evaluates a condition, then schedules one iteration and the next test.
    Loop,
    /// One index of a concurrent group.
    Member { group: u32, index: usize },
}

/// What the backend learns about a task when it is registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub name: Cow<'static, str>,
    pub parent: Option<TaskId>,
    pub kind: TaskKind,
    pub dependencies: Vec<UseId>,
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub task: TaskId,
    pub name: Cow<'static, str>,
    pub start: Instant,
    pub duration: Duration,
}

/// What happened during [`Runtime::run`](crate::Runtime::run).
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Executed tasks, in execution order.
    pub executions: Vec<TaskExecution>,
    pub registered: usize,
}

impl Diagnostics {
    pub fn executed(&self) -> usize {
        self.executions.len()
    }

    /// Position of the first executed task with this name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.executions.iter().position(|e| e.name == name)
    }

    pub fn order(&self) -> Vec<&str> {
        self.executions.iter().map(|e| e.name.as_ref()).collect()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} of {} registered task(s) executed",
            self.executed(),
            self.registered
        )?;
        for exec in &self.executions {
            writeln!(f, "  {} {} {:.2?}", exec.task, exec.name, exec.duration)?;
        }
        Ok(())
    }
}
