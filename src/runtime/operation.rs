//! Interpreter steps and the agenda they are queued on
//!
//! Every unit of interpretation is an [`Operation`]: one [`Step`] applied to one
//! execution. Steps never call each other; a step that needs a follow-up pushes
//! it onto the [`Agenda`], which the trampoline drains in FIFO order.

use std::collections::VecDeque;
use std::fmt;

use super::execution::ExecutionId;

/// Closed set of interpreter steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Fire process start listeners, then enter the initial activity
    ProcessStart,
    /// Fire start listeners of the current activity
    NotifyStart,
    /// Run the behavior of the current activity
    ExecuteActivity,
    /// Fire end listeners of the activity being left through a transition
    NotifyEnd,
    /// Leave the current scope if the pending transition crosses its boundary
    DestroyScope,
    /// Fire take listeners of the pending transition
    NotifyTake,
    /// Enter the transition destination, creating a scope execution if needed
    CreateScope,
    /// Fire end listeners of an activity whose path ends, then propagate completion
    ActivityEnd,
    /// All paths inside a scope ended
    ScopeEnd,
    /// Fire process end listeners and tear the instance down
    ProcessEnd,
}

impl Step {
    /// Short name used in logs
    pub fn name(self) -> &'static str {
        match self {
            Step::ProcessStart => "process-start",
            Step::NotifyStart => "notify-start",
            Step::ExecuteActivity => "execute-activity",
            Step::NotifyEnd => "notify-end",
            Step::DestroyScope => "destroy-scope",
            Step::NotifyTake => "notify-take",
            Step::CreateScope => "create-scope",
            Step::ActivityEnd => "activity-end",
            Step::ScopeEnd => "scope-end",
            Step::ProcessEnd => "process-end",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A step bound to the execution it advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    /// Execution to advance
    pub execution: ExecutionId,
    /// Step to apply
    pub step: Step,
}

/// FIFO queue of pending operations
#[derive(Debug, Default)]
pub struct Agenda {
    queue: VecDeque<Operation>,
}

impl Agenda {
    /// Create an empty agenda
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a step at the back
    pub fn push(&mut self, execution: ExecutionId, step: Step) {
        self.queue.push_back(Operation { execution, step });
    }

    /// Take the next operation
    pub fn pop(&mut self) -> Option<Operation> {
        self.queue.pop_front()
    }

    /// Retarget every operation queued for `from` onto `to`, keeping queue order.
    ///
    /// Returns the number of retargeted operations.
    pub fn transfer(&mut self, from: ExecutionId, to: ExecutionId) -> usize {
        let mut moved = 0;
        for op in self.queue.iter_mut().filter(|op| op.execution == from) {
            op.execution = to;
            moved += 1;
        }
        moved
    }

    /// Number of operations queued for `execution`
    pub fn pending_for(&self, execution: ExecutionId) -> usize {
        self.queue.iter().filter(|op| op.execution == execution).count()
    }

    /// Drop everything queued
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
