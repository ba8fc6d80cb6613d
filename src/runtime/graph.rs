//! Activity graph: the immutable description of a process definition
//!
//! A definition is a tree of scopes (the process itself and any sub-process
//! activities) holding activities connected by transitions. Definitions are
//! built once through [`ProcessDefinitionBuilder`] and then shared behind an
//! `Arc` by every execution that runs them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::{EngineError, Result};
use super::expression::Expression;
use super::listener::{ExecutionEvent, ListenerDescriptor, TaskEvent};
use super::subscription::EventKind;

/// What an activity does when an execution arrives on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Behavior {
    /// Plain start event; passes straight through
    NoneStart,
    /// Automatic activity that completes immediately
    PassThrough,
    /// Wait state resumed by an explicit trigger
    Wait,
    /// Human task; creates a task entity and waits for its completion
    UserTask {
        /// Assignee set when the task is created
        assignee: Option<String>,
    },
    /// Intermediate catch event waiting for a signal or message
    CatchEvent {
        /// Signal or message
        kind: EventKind,
        /// Name the event is correlated by
        event_name: String,
    },
    /// Forks on multiple outgoing transitions, joins on multiple incoming ones
    ParallelGateway,
    /// Takes exactly one outgoing transition selected by condition
    ExclusiveGateway,
    /// Scope activity holding nested activities
    SubProcess,
    /// Plain end event; ends the arriving path
    NoneEnd,
}

impl Behavior {
    /// User task without an initial assignee
    pub fn user_task() -> Self {
        Behavior::UserTask { assignee: None }
    }

    /// Catch event waiting for a message
    pub fn message(name: impl Into<String>) -> Self {
        Behavior::CatchEvent {
            kind: EventKind::Message,
            event_name: name.into(),
        }
    }

    /// Catch event waiting for a signal
    pub fn signal(name: impl Into<String>) -> Self {
        Behavior::CatchEvent {
            kind: EventKind::Signal,
            event_name: name.into(),
        }
    }

    /// Whether entering this activity creates a nested scope
    pub fn is_scope(&self) -> bool {
        matches!(self, Behavior::SubProcess)
    }

    /// Short tag used in logs and error messages
    pub fn tag(&self) -> &'static str {
        match self {
            Behavior::NoneStart => "none-start",
            Behavior::PassThrough => "pass-through",
            Behavior::Wait => "wait",
            Behavior::UserTask { .. } => "user-task",
            Behavior::CatchEvent { .. } => "catch-event",
            Behavior::ParallelGateway => "parallel-gateway",
            Behavior::ExclusiveGateway => "exclusive-gateway",
            Behavior::SubProcess => "sub-process",
            Behavior::NoneEnd => "none-end",
        }
    }
}

/// A node of the activity graph
#[derive(Debug, Clone)]
pub struct Activity {
    id: String,
    name: Option<String>,
    behavior: Behavior,
    parent: Option<String>,
    children: Vec<String>,
    initial: Option<String>,
    outgoing: Vec<String>,
    incoming: Vec<String>,
    start_listeners: Vec<ListenerDescriptor>,
    end_listeners: Vec<ListenerDescriptor>,
    task_listeners: Vec<(TaskEvent, ListenerDescriptor)>,
}

impl Activity {
    fn new(id: String, behavior: Behavior, parent: Option<String>) -> Self {
        Self {
            id,
            name: None,
            behavior,
            parent,
            children: Vec::new(),
            initial: None,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            start_listeners: Vec::new(),
            end_listeners: Vec::new(),
            task_listeners: Vec::new(),
        }
    }

    /// Activity id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name, falling back to the id
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Behavior tag
    pub fn behavior(&self) -> &Behavior {
        &self.behavior
    }

    /// Enclosing scope activity, `None` at process level
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Whether this activity is a scope
    pub fn is_scope(&self) -> bool {
        self.behavior.is_scope()
    }

    /// Nested activities, for scopes
    pub fn children(&self) -> &[String] {
        &self.children
    }

    /// Activity entered when this scope starts
    pub fn initial(&self) -> Option<&str> {
        self.initial.as_deref()
    }

    /// Outgoing transition ids in declaration order
    pub fn outgoing(&self) -> &[String] {
        &self.outgoing
    }

    /// Incoming transition ids in declaration order
    pub fn incoming(&self) -> &[String] {
        &self.incoming
    }

    /// Execution listeners for `start` or `end`
    pub fn execution_listeners(&self, event: ExecutionEvent) -> &[ListenerDescriptor] {
        match event {
            ExecutionEvent::Start => &self.start_listeners,
            ExecutionEvent::End => &self.end_listeners,
            ExecutionEvent::Take => &[],
        }
    }

    /// Task-lifecycle listeners in declaration order, keyed by event
    pub fn task_listeners(&self) -> &[(TaskEvent, ListenerDescriptor)] {
        &self.task_listeners
    }
}

/// Directed edge between two activities
#[derive(Debug, Clone)]
pub struct Transition {
    id: String,
    source: String,
    destination: String,
    condition: Option<Expression>,
    is_default: bool,
    listeners: Vec<ListenerDescriptor>,
}

impl Transition {
    /// Transition id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Source activity id
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Destination activity id
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Condition guarding this transition, if any
    pub fn condition(&self) -> Option<&Expression> {
        self.condition.as_ref()
    }

    /// Whether this is the default flow of an exclusive gateway
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Take listeners in declaration order
    pub fn listeners(&self) -> &[ListenerDescriptor] {
        &self.listeners
    }
}

/// Immutable, shareable process definition
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    key: String,
    name: Option<String>,
    pub(crate) version: u32,
    activities: HashMap<String, Activity>,
    top_level: Vec<String>,
    transitions: HashMap<String, Transition>,
    initial: String,
    start_listeners: Vec<ListenerDescriptor>,
    end_listeners: Vec<ListenerDescriptor>,
}

impl ProcessDefinition {
    /// Definition key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Display name, falling back to the key
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.key)
    }

    /// Deployment version, 0 until deployed
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Look up an activity
    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.activities.get(id)
    }

    /// Look up a transition
    pub fn transition(&self, id: &str) -> Option<&Transition> {
        self.transitions.get(id)
    }

    /// Activities declared directly in the process scope
    pub fn top_level_activities(&self) -> &[String] {
        &self.top_level
    }

    /// Initial activity of the process scope
    pub fn initial(&self) -> &str {
        &self.initial
    }

    /// Process-level listeners for `start` or `end`
    pub fn execution_listeners(&self, event: ExecutionEvent) -> &[ListenerDescriptor] {
        match event {
            ExecutionEvent::Start => &self.start_listeners,
            ExecutionEvent::End => &self.end_listeners,
            ExecutionEvent::Take => &[],
        }
    }

    pub(crate) fn require_activity(&self, id: &str) -> Result<&Activity> {
        self.activity(id).ok_or_else(|| {
            EngineError::illegal_state(format!(
                "activity '{}' is not part of definition '{}'",
                id, self.key
            ))
        })
    }

    pub(crate) fn require_transition(&self, id: &str) -> Result<&Transition> {
        self.transition(id).ok_or_else(|| {
            EngineError::illegal_state(format!(
                "transition '{}' is not part of definition '{}'",
                id, self.key
            ))
        })
    }

    /// Outgoing transitions of `activity` in declaration order
    pub fn outgoing(&self, activity: &str) -> Vec<&Transition> {
        self.activity(activity)
            .map(|act| {
                act.outgoing
                    .iter()
                    .filter_map(|id| self.transitions.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
enum Cursor {
    Process,
    Activity(String),
    Transition(String),
}

/// Programmatic builder for [`ProcessDefinition`]s
///
/// Activities are added to the innermost open scope. Listener, condition and
/// naming calls apply to the element added last.
#[derive(Debug)]
pub struct ProcessDefinitionBuilder {
    key: String,
    name: Option<String>,
    activities: HashMap<String, Activity>,
    top_level: Vec<String>,
    transitions: HashMap<String, Transition>,
    transition_order: Vec<String>,
    scope_stack: Vec<String>,
    cursor: Cursor,
    start_listeners: Vec<ListenerDescriptor>,
    end_listeners: Vec<ListenerDescriptor>,
    errors: Vec<String>,
}

impl ProcessDefinitionBuilder {
    /// Start a definition with the given key
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            activities: HashMap::new(),
            top_level: Vec::new(),
            transitions: HashMap::new(),
            transition_order: Vec::new(),
            scope_stack: Vec::new(),
            cursor: Cursor::Process,
            start_listeners: Vec::new(),
            end_listeners: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Name the element added last (or the process, before any element)
    pub fn name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        match &self.cursor {
            Cursor::Process => self.name = Some(name),
            Cursor::Activity(id) => {
                if let Some(activity) = self.activities.get_mut(id) {
                    activity.name = Some(name);
                }
            }
            Cursor::Transition(id) => self
                .errors
                .push(format!("transition '{}' cannot be named", id)),
        }
        self
    }

    /// Add an activity to the current scope
    pub fn activity(mut self, id: impl Into<String>, behavior: Behavior) -> Self {
        let id = id.into();
        if self.activities.contains_key(&id) {
            self.errors.push(format!("duplicate activity id '{}'", id));
            return self;
        }
        let parent = self.scope_stack.last().cloned();
        match &parent {
            Some(scope) => {
                if let Some(scope_activity) = self.activities.get_mut(scope) {
                    scope_activity.children.push(id.clone());
                }
            }
            None => self.top_level.push(id.clone()),
        }
        self.activities
            .insert(id.clone(), Activity::new(id.clone(), behavior, parent));
        self.cursor = Cursor::Activity(id);
        self
    }

    /// Add a sub-process activity and make it the current scope
    pub fn begin_scope(self, id: impl Into<String>) -> Self {
        let id = id.into();
        let mut builder = self.activity(id.clone(), Behavior::SubProcess);
        builder.scope_stack.push(id);
        builder
    }

    /// Close the current scope; later listener calls apply to the scope activity
    pub fn end_scope(mut self) -> Self {
        match self.scope_stack.pop() {
            Some(scope) => self.cursor = Cursor::Activity(scope),
            None => self.errors.push("end_scope without open scope".to_string()),
        }
        self
    }

    /// Add a transition
    pub fn flow(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        let id = id.into();
        if self.transitions.contains_key(&id) {
            self.errors.push(format!("duplicate transition id '{}'", id));
            return self;
        }
        self.transitions.insert(
            id.clone(),
            Transition {
                id: id.clone(),
                source: source.into(),
                destination: destination.into(),
                condition: None,
                is_default: false,
                listeners: Vec::new(),
            },
        );
        self.transition_order.push(id.clone());
        self.cursor = Cursor::Transition(id);
        self
    }

    /// Guard the transition added last with a `${...}` condition
    pub fn condition(mut self, expression: &str) -> Self {
        match Expression::parse(expression) {
            Ok(parsed) => match self.current_transition() {
                Some(transition) => transition.condition = Some(parsed),
                None => self
                    .errors
                    .push(format!("condition '{}' outside of a transition", expression)),
            },
            Err(err) => self.errors.push(err.to_string()),
        }
        self
    }

    /// Mark the transition added last as default flow
    pub fn default_flow(mut self) -> Self {
        match self.current_transition() {
            Some(transition) => transition.is_default = true,
            None => self
                .errors
                .push("default_flow outside of a transition".to_string()),
        }
        self
    }

    fn current_transition(&mut self) -> Option<&mut Transition> {
        match &self.cursor {
            Cursor::Transition(id) => self.transitions.get_mut(id),
            _ => None,
        }
    }

    /// Attach an execution listener to the element added last
    pub fn execution_listener(mut self, event: ExecutionEvent, listener: ListenerDescriptor) -> Self {
        let cursor = self.cursor.clone();
        match (cursor, event) {
            (Cursor::Process, ExecutionEvent::Start) => self.start_listeners.push(listener),
            (Cursor::Process, ExecutionEvent::End) => self.end_listeners.push(listener),
            (Cursor::Activity(id), ExecutionEvent::Start) => {
                if let Some(activity) = self.activities.get_mut(&id) {
                    activity.start_listeners.push(listener);
                }
            }
            (Cursor::Activity(id), ExecutionEvent::End) => {
                if let Some(activity) = self.activities.get_mut(&id) {
                    activity.end_listeners.push(listener);
                }
            }
            (Cursor::Transition(id), ExecutionEvent::Take) => {
                if let Some(transition) = self.transitions.get_mut(&id) {
                    transition.listeners.push(listener);
                }
            }
            (Cursor::Transition(id), other) => self.errors.push(format!(
                "transition '{}' only supports take listeners, got '{}'",
                id, other
            )),
            (_, ExecutionEvent::Take) => self
                .errors
                .push("take listeners belong on transitions".to_string()),
        }
        self
    }

    /// Attach a task-lifecycle listener to the user task added last
    pub fn task_listener(mut self, event: TaskEvent, listener: ListenerDescriptor) -> Self {
        let target = match &self.cursor {
            Cursor::Activity(id) => self.activities.get_mut(id),
            _ => None,
        };
        match target {
            Some(activity) if matches!(activity.behavior, Behavior::UserTask { .. }) => {
                activity.task_listeners.push((event, listener));
            }
            Some(activity) => {
                let message = format!("task listener on non-task activity '{}'", activity.id);
                self.errors.push(message);
            }
            None => self
                .errors
                .push("task listener outside of an activity".to_string()),
        }
        self
    }

    /// Validate and produce the definition
    pub fn build(mut self) -> Result<ProcessDefinition> {
        if let Some(open) = self.scope_stack.last() {
            self.errors.push(format!("scope '{}' was never closed", open));
        }

        for id in &self.transition_order {
            let transition = &self.transitions[id];
            let (Some(source), Some(destination)) = (
                self.activities.get(&transition.source),
                self.activities.get(&transition.destination),
            ) else {
                self.errors.push(format!(
                    "transition '{}' connects unknown activities '{}' -> '{}'",
                    id, transition.source, transition.destination
                ));
                continue;
            };
            if !encloses(&self.activities, source.parent.as_deref(), destination.parent.as_deref()) {
                self.errors.push(format!(
                    "transition '{}' enters a nested scope; '{}' is not reachable from '{}'",
                    id, transition.destination, transition.source
                ));
            }
        }

        if !self.errors.is_empty() {
            return Err(EngineError::InvalidDefinition(self.errors.join("; ")));
        }

        for id in &self.transition_order {
            let (source, destination) = {
                let transition = &self.transitions[id];
                (transition.source.clone(), transition.destination.clone())
            };
            if let Some(activity) = self.activities.get_mut(&source) {
                activity.outgoing.push(id.clone());
            }
            if let Some(activity) = self.activities.get_mut(&destination) {
                activity.incoming.push(id.clone());
            }
        }

        let initial = find_initial(&self.activities, &self.top_level).ok_or_else(|| {
            EngineError::InvalidDefinition(format!("process '{}' has no initial activity", self.key))
        })?;

        let scopes: Vec<String> = self
            .activities
            .values()
            .filter(|activity| activity.is_scope())
            .map(|activity| activity.id.clone())
            .collect();
        for scope in scopes {
            let children = self.activities[&scope].children.clone();
            let scope_initial = find_initial(&self.activities, &children).ok_or_else(|| {
                EngineError::InvalidDefinition(format!("scope '{}' has no initial activity", scope))
            })?;
            if let Some(activity) = self.activities.get_mut(&scope) {
                activity.initial = Some(scope_initial);
            }
        }

        Ok(ProcessDefinition {
            key: self.key,
            name: self.name,
            version: 0,
            activities: self.activities,
            top_level: self.top_level,
            transitions: self.transitions,
            initial,
            start_listeners: self.start_listeners,
            end_listeners: self.end_listeners,
        })
    }
}

/// Whether `outer` is `inner` or one of its enclosing scopes
fn encloses(activities: &HashMap<String, Activity>, inner: Option<&str>, outer: Option<&str>) -> bool {
    let mut cursor = inner;
    loop {
        if cursor == outer {
            return true;
        }
        match cursor {
            None => return false,
            Some(id) => cursor = activities.get(id).and_then(|activity| activity.parent.as_deref()),
        }
    }
}

/// First none-start event, else the first activity without incoming transitions
fn find_initial(activities: &HashMap<String, Activity>, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .find(|id| matches!(activities[*id].behavior, Behavior::NoneStart))
        .or_else(|| candidates.iter().find(|id| activities[*id].incoming.is_empty()))
        .cloned()
}
