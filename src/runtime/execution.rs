//! Execution tree: runtime positions of running process instances
//!
//! Executions live in an arena indexed by [`ExecutionId`]. Parent/child links are
//! index references, so ending an execution never invalidates other handles: an
//! ended execution stays in the arena with its `ended` flag set, which lets stale
//! references detect the condition instead of corrupting the tree.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::error::{EngineError, Result};
use super::graph::ProcessDefinition;

/// Execution identifier, stable for the lifetime of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listener currently being invoked on an execution or task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentListener {
    /// Event being dispatched (`start`, `end`, `take`, `create`, ...)
    pub event: String,
    /// Description of the listener implementation
    pub listener: String,
}

/// A runtime position in a running process instance
#[derive(Debug, Clone)]
pub struct Execution {
    id: ExecutionId,
    process_instance: ExecutionId,
    definition: Arc<ProcessDefinition>,
    pub(crate) parent: Option<ExecutionId>,
    pub(crate) children: Vec<ExecutionId>,
    pub(crate) activity: Option<String>,
    pub(crate) active: bool,
    pub(crate) is_scope: bool,
    pub(crate) is_concurrent: bool,
    pub(crate) transition: Option<String>,
    pub(crate) listener_index: usize,
    pub(crate) current_listener: Option<CurrentListener>,
    pub(crate) variables: HashMap<String, Value>,
    pub(crate) ended: bool,
}

impl Execution {
    /// Execution id
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Id of the process instance (root execution) this execution belongs to
    pub fn process_instance_id(&self) -> ExecutionId {
        self.process_instance
    }

    /// Whether this execution is the process instance itself
    pub fn is_process_instance(&self) -> bool {
        self.parent.is_none()
    }

    /// Definition the process instance runs
    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    /// Parent execution, `None` for the process instance
    pub fn parent(&self) -> Option<ExecutionId> {
        self.parent
    }

    /// Child executions in creation order
    pub fn children(&self) -> &[ExecutionId] {
        &self.children
    }

    /// Current activity, if the execution is positioned on one
    pub fn activity_id(&self) -> Option<&str> {
        self.activity.as_deref()
    }

    /// Only active executions may be advanced
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Scope container (owns nested state) versus a bare concurrent branch
    pub fn is_scope(&self) -> bool {
        self.is_scope
    }

    /// Whether this execution is one branch of a concurrent region
    pub fn is_concurrent(&self) -> bool {
        self.is_concurrent
    }

    /// Transition being taken, set only while mid-take
    pub fn transition_id(&self) -> Option<&str> {
        self.transition.as_deref()
    }

    /// Listener currently running on this execution
    pub fn current_listener(&self) -> Option<&CurrentListener> {
        self.current_listener.as_ref()
    }

    /// Variables stored on this execution only
    pub fn local_variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Whether the execution has ended
    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

/// Arena of executions for all process instances of an engine
#[derive(Debug, Default)]
pub struct ExecutionTree {
    executions: Vec<Execution>,
}

impl ExecutionTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ExecutionId {
        ExecutionId(self.executions.len() as u64)
    }

    /// Create the root execution of a new process instance
    pub fn create_root(&mut self, definition: Arc<ProcessDefinition>) -> ExecutionId {
        let id = self.next_id();
        self.executions.push(Execution {
            id,
            process_instance: id,
            definition,
            parent: None,
            children: Vec::new(),
            activity: None,
            active: true,
            is_scope: true,
            is_concurrent: false,
            transition: None,
            listener_index: 0,
            current_listener: None,
            variables: HashMap::new(),
            ended: false,
        });
        id
    }

    /// Create a child of `parent`, appended to its children
    pub fn create_child(
        &mut self,
        parent: ExecutionId,
        is_scope: bool,
        is_concurrent: bool,
    ) -> Result<ExecutionId> {
        let (process_instance, definition) = {
            let parent_exec = self.live(parent)?;
            (parent_exec.process_instance, parent_exec.definition.clone())
        };
        let id = self.next_id();
        self.executions.push(Execution {
            id,
            process_instance,
            definition,
            parent: Some(parent),
            children: Vec::new(),
            activity: None,
            active: true,
            is_scope,
            is_concurrent,
            transition: None,
            listener_index: 0,
            current_listener: None,
            variables: HashMap::new(),
            ended: false,
        });
        self.slot_mut(parent).children.push(id);
        Ok(id)
    }

    fn slot_mut(&mut self, id: ExecutionId) -> &mut Execution {
        &mut self.executions[id.0 as usize]
    }

    /// Look up an execution, ended or not
    pub fn get(&self, id: ExecutionId) -> Option<&Execution> {
        self.executions.get(id.0 as usize)
    }

    pub(crate) fn get_mut(&mut self, id: ExecutionId) -> Option<&mut Execution> {
        self.executions.get_mut(id.0 as usize)
    }

    /// Look up an execution that has not ended
    pub fn live(&self, id: ExecutionId) -> Result<&Execution> {
        match self.get(id) {
            None => Err(EngineError::not_found("execution", id)),
            Some(exec) if exec.ended => Err(EngineError::illegal_state(format!(
                "execution {} has already ended",
                id
            ))),
            Some(exec) => Ok(exec),
        }
    }

    pub(crate) fn live_mut(&mut self, id: ExecutionId) -> Result<&mut Execution> {
        self.live(id)?;
        Ok(self.slot_mut(id))
    }

    /// Whether `id` refers to an execution that is still part of a tree
    pub fn is_live(&self, id: ExecutionId) -> bool {
        self.get(id).is_some_and(|exec| !exec.ended)
    }

    /// Iterate over all executions that have not ended
    pub fn iter_live(&self) -> impl Iterator<Item = &Execution> {
        self.executions.iter().filter(|exec| !exec.ended)
    }

    /// The nearest scope execution: `id` itself if it is a scope, otherwise its parent
    pub fn scope_execution(&self, id: ExecutionId) -> Result<ExecutionId> {
        let exec = self.live(id)?;
        if exec.is_scope {
            return Ok(id);
        }
        exec.parent.ok_or_else(|| {
            EngineError::illegal_state(format!("concurrent execution {} has no parent", id))
        })
    }

    /// Activity whose scope `id` currently runs in, `None` for the process level
    ///
    /// A scope execution created for a scope activity hangs below an execution
    /// positioned on that activity, so the answer is the position of the scope
    /// execution's parent.
    pub fn scope_activity(&self, id: ExecutionId) -> Result<Option<String>> {
        let scope = self.scope_execution(id)?;
        match self.live(scope)?.parent {
            None => Ok(None),
            Some(parent) => Ok(self.live(parent)?.activity.clone()),
        }
    }

    /// End `id` and all of its descendants, detaching it from its parent.
    ///
    /// Returns the ended executions, descendants before ancestors. Ending an
    /// already ended execution is a no-op.
    pub fn end(&mut self, id: ExecutionId) -> Vec<ExecutionId> {
        if !self.is_live(id) {
            return Vec::new();
        }
        if let Some(parent) = self.executions[id.0 as usize].parent {
            self.slot_mut(parent).children.retain(|child| *child != id);
        }

        let mut ended = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                let exec = self.slot_mut(current);
                exec.ended = true;
                exec.active = false;
                exec.transition = None;
                exec.children.clear();
                ended.push(current);
            } else {
                stack.push((current, true));
                for child in self.executions[current.0 as usize].children.iter().rev() {
                    stack.push((*child, false));
                }
            }
        }
        ended
    }

    /// `id` and its live descendants, ancestors before descendants
    pub fn subtree(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut collected = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(exec) = self.get(current).filter(|exec| !exec.ended) else {
                continue;
            };
            collected.push(current);
            stack.extend(exec.children.iter().rev().copied());
        }
        collected
    }

    /// Read a variable, walking from `id` up the parent chain
    pub fn variable(&self, id: ExecutionId, name: &str) -> Option<&Value> {
        let mut cursor = self.get(id);
        while let Some(exec) = cursor {
            if let Some(value) = exec.variables.get(name) {
                return Some(value);
            }
            cursor = exec.parent.and_then(|parent| self.get(parent));
        }
        None
    }

    /// All variables visible from `id`; nearer executions shadow ancestors
    pub fn variables(&self, id: ExecutionId) -> HashMap<String, Value> {
        let mut chain = Vec::new();
        let mut cursor = self.get(id);
        while let Some(exec) = cursor {
            chain.push(exec);
            cursor = exec.parent.and_then(|parent| self.get(parent));
        }

        let mut merged = HashMap::new();
        for exec in chain.into_iter().rev() {
            for (name, value) in &exec.variables {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }

    /// Write a variable: to the nearest execution that already holds it locally,
    /// otherwise to the process instance.
    pub fn set_variable(&mut self, id: ExecutionId, name: &str, value: Value) -> Result<()> {
        let mut target = self.live(id)?.id;
        let mut cursor = Some(target);
        while let Some(current) = cursor {
            let exec = &self.executions[current.0 as usize];
            if exec.variables.contains_key(name) {
                target = current;
                break;
            }
            target = current;
            cursor = exec.parent;
        }
        self.slot_mut(target)
            .variables
            .insert(name.to_string(), value);
        Ok(())
    }

    /// Write a variable on `id` itself, shadowing any ancestor
    pub fn set_variable_local(&mut self, id: ExecutionId, name: &str, value: Value) -> Result<()> {
        self.live_mut(id)?
            .variables
            .insert(name.to_string(), value);
        Ok(())
    }

    /// Number of executions ever created
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    /// Whether no execution was ever created
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}
