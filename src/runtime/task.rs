//! User tasks
//!
//! A user-task activity creates a [`Task`] and waits. Completing the task fires
//! its complete listeners, removes it and moves the execution on; a task whose
//! execution is left any other way is deleted with delete listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::ProcessEngine;
use super::error::{EngineError, Result};
use super::execution::{CurrentListener, ExecutionId};
use super::graph::Activity;
use super::listener::TaskEvent;
use super::transaction::TransactionContext;

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human task waiting for completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    name: String,
    activity_id: String,
    execution_id: ExecutionId,
    process_instance_id: ExecutionId,
    assignee: Option<String>,
    created: DateTime<Utc>,
    current_listener: Option<CurrentListener>,
}

impl Task {
    /// Task id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Display name, taken from the activity
    pub fn name(&self) -> &str {
        &self.name
    }

    /// User-task activity that created the task
    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    /// Waiting execution
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Process instance of the waiting execution
    pub fn process_instance_id(&self) -> ExecutionId {
        self.process_instance_id
    }

    /// Current assignee
    pub fn assignee(&self) -> Option<&str> {
        self.assignee.as_deref()
    }

    /// Creation time
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Listener currently running for this task
    pub fn current_listener(&self) -> Option<&CurrentListener> {
        self.current_listener.as_ref()
    }
}

impl ProcessEngine {
    /// Look up a task
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub(crate) fn set_task_marker(&mut self, id: TaskId, marker: Option<CurrentListener>) {
        if let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) {
            task.current_listener = marker;
        }
    }

    pub(crate) fn create_task(
        &mut self,
        execution: ExecutionId,
        activity: &Activity,
        assignee: Option<String>,
        tx: &mut TransactionContext,
    ) -> Result<TaskId> {
        let process_instance_id = self.tree.live(execution)?.process_instance_id();
        let task = Task {
            id: TaskId::new(),
            name: activity.name().to_string(),
            activity_id: activity.id().to_string(),
            execution_id: execution,
            process_instance_id,
            assignee: assignee.clone(),
            created: Utc::now(),
            current_listener: None,
        };
        let id = task.id;
        tracing::debug!(task = %id, activity = activity.id(), execution = %execution, "Created task");
        self.tasks.push(task);

        self.fire_task_listeners(id, TaskEvent::Create, tx)?;
        if assignee.is_some() {
            self.fire_task_listeners(id, TaskEvent::Assignment, tx)?;
        }
        Ok(id)
    }

    /// Change the assignee and fire assignment listeners
    pub fn set_assignee(
        &mut self,
        id: TaskId,
        assignee: Option<String>,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let task = self
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| EngineError::not_found("task", id))?;
        if task.assignee == assignee {
            return Ok(());
        }
        task.assignee = assignee;
        self.fire_task_listeners(id, TaskEvent::Assignment, tx)
    }

    /// Complete a task: store `variables`, fire complete listeners, remove the
    /// task and leave the user-task activity.
    pub fn complete_task(
        &mut self,
        id: TaskId,
        variables: HashMap<String, Value>,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let execution = self
            .task(id)
            .map(|task| task.execution_id)
            .ok_or_else(|| EngineError::not_found("task", id))?;
        self.tree.live(execution)?;

        self.interpret(tx, |engine, tx| {
            for (name, value) in variables {
                engine.tree.set_variable(execution, &name, value)?;
            }
            engine.fire_task_listeners(id, TaskEvent::Complete, tx)?;
            engine.tasks.retain(|task| task.id != id);
            tracing::debug!(task = %id, execution = %execution, "Completed task");
            engine.leave(execution, tx)
        })
    }

    /// Move the tasks of `from` onto `to`
    pub(crate) fn reassign_tasks(&mut self, from: ExecutionId, to: ExecutionId) -> usize {
        let mut moved = 0;
        for task in self.tasks.iter_mut().filter(|task| task.execution_id == from) {
            task.execution_id = to;
            moved += 1;
        }
        moved
    }

    /// Delete the tasks of one execution, firing delete listeners
    pub(crate) fn delete_tasks_of(
        &mut self,
        execution: ExecutionId,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let doomed: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|task| task.execution_id == execution)
            .map(|task| task.id)
            .collect();
        for id in doomed {
            self.fire_task_listeners(id, TaskEvent::Delete, tx)?;
            self.tasks.retain(|task| task.id != id);
            tracing::debug!(task = %id, execution = %execution, "Deleted task");
        }
        Ok(())
    }

    /// Start a filtered task query
    pub fn task_query(&self) -> TaskQuery<'_> {
        TaskQuery {
            tasks: &self.tasks,
            process_instance_id: None,
            execution_id: None,
            activity_id: None,
            assignee: None,
        }
    }
}

/// Builder-style filter over open tasks; filters combine with AND
pub struct TaskQuery<'a> {
    tasks: &'a [Task],
    process_instance_id: Option<ExecutionId>,
    execution_id: Option<ExecutionId>,
    activity_id: Option<String>,
    assignee: Option<String>,
}

impl<'a> TaskQuery<'a> {
    /// Filter by process instance
    pub fn process_instance_id(mut self, instance: ExecutionId) -> Self {
        self.process_instance_id = Some(instance);
        self
    }

    /// Filter by execution
    pub fn execution_id(mut self, execution: ExecutionId) -> Self {
        self.execution_id = Some(execution);
        self
    }

    /// Filter by user-task activity
    pub fn activity_id(mut self, activity: impl Into<String>) -> Self {
        self.activity_id = Some(activity.into());
        self
    }

    /// Filter by assignee
    pub fn assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    fn matches(&self, task: &Task) -> bool {
        self.process_instance_id
            .is_none_or(|instance| task.process_instance_id == instance)
            && self.execution_id.is_none_or(|execution| task.execution_id == execution)
            && self
                .activity_id
                .as_deref()
                .is_none_or(|activity| task.activity_id == activity)
            && self
                .assignee
                .as_deref()
                .is_none_or(|assignee| task.assignee.as_deref() == Some(assignee))
    }

    /// Matching tasks in creation order
    pub fn list(&self) -> Vec<&'a Task> {
        self.tasks.iter().filter(|task| self.matches(task)).collect()
    }

    /// Number of matching tasks
    pub fn count(&self) -> usize {
        self.tasks.iter().filter(|task| self.matches(task)).count()
    }

    /// The single match, if any; more than one match is an error
    pub fn single_result(&self) -> Result<Option<&'a Task>> {
        let mut matches = self.list();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            count => Err(EngineError::NonUniqueResult {
                entity: "task",
                count,
            }),
        }
    }
}
