//! Listener contracts, descriptors and the delegate handles passed to user code
//!
//! Listeners are attached to activities, transitions and the process itself by
//! [`ListenerDescriptor`]s. A descriptor names one of four implementation kinds
//! and optionally a transaction stage; the dispatcher resolves it to a
//! [`Delegate`] and either invokes it on the spot or defers it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::ProcessEngine;
use super::dispatcher::TransactionDependentScope;
use super::error::Result;
use super::execution::{CurrentListener, ExecutionId};
use super::subscription::EventKind;
use super::task::{Task, TaskId};
use super::transaction::{TransactionContext, TransactionState};

/// Execution-level event a listener can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionEvent {
    /// An activity (or the process) is entered
    Start,
    /// An activity (or the process) is left
    End,
    /// A transition is taken
    Take,
}

impl fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionEvent::Start => "start",
            ExecutionEvent::End => "end",
            ExecutionEvent::Take => "take",
        };
        f.write_str(name)
    }
}

/// Task-lifecycle event a listener can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskEvent {
    /// Task was created
    Create,
    /// Task assignee changed
    Assignment,
    /// Task is being completed
    Complete,
    /// Task is deleted without completion
    Delete,
    /// Matches every event above
    All,
}

impl TaskEvent {
    /// Whether a listener registered for `self` fires on `fired`
    pub fn matches(self, fired: TaskEvent) -> bool {
        self == TaskEvent::All || self == fired
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskEvent::Create => "create",
            TaskEvent::Assignment => "assignment",
            TaskEvent::Complete => "complete",
            TaskEvent::Delete => "delete",
            TaskEvent::All => "all-events",
        };
        f.write_str(name)
    }
}

/// Listener invoked synchronously with a live execution handle
pub trait ExecutionListener: Send + Sync {
    /// Handle the event
    fn notify(&self, execution: &mut DelegateExecution<'_>) -> anyhow::Result<()>;
}

/// Listener invoked synchronously with a live task handle
pub trait TaskListener: Send + Sync {
    /// Handle the event
    fn notify(&self, task: &mut DelegateTask<'_>) -> anyhow::Result<()>;
}

/// Listener deferred to a transaction stage; sees only a frozen snapshot
pub trait TransactionDependentListener: Send + Sync {
    /// Handle the event once the transaction reaches the registered stage
    fn notify(&self, scope: &TransactionDependentScope) -> anyhow::Result<()>;
}

/// Computes extra properties captured alongside a deferred listener
pub trait CustomPropertiesResolver: Send + Sync {
    /// Resolve properties against the current execution state
    fn resolve(&self, execution: &DelegateExecution<'_>) -> anyhow::Result<HashMap<String, Value>>;
}

/// Function bean invoked when a fixed expression names it
pub type ExpressionFunction =
    Arc<dyn Fn(&mut DelegateExecution<'_>) -> anyhow::Result<Value> + Send + Sync>;

/// Anything an expression, class reference or instance can resolve to
#[derive(Clone)]
pub enum Delegate {
    /// Synchronous execution listener
    ExecutionListener(Arc<dyn ExecutionListener>),
    /// Synchronous task listener
    TaskListener(Arc<dyn TaskListener>),
    /// Transaction-dependent listener
    TransactionDependent(Arc<dyn TransactionDependentListener>),
    /// Custom-properties resolver
    PropertiesResolver(Arc<dyn CustomPropertiesResolver>),
    /// Callable bean for fixed expressions
    Function(ExpressionFunction),
    /// Plain value
    Value(Value),
}

impl Delegate {
    /// Wrap a closure as an execution listener
    pub fn execution_fn<F>(f: F) -> Self
    where
        F: Fn(&mut DelegateExecution<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Delegate::ExecutionListener(Arc::new(FnExecutionListener(f)))
    }

    /// Wrap a closure as a task listener
    pub fn task_fn<F>(f: F) -> Self
    where
        F: Fn(&mut DelegateTask<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Delegate::TaskListener(Arc::new(FnTaskListener(f)))
    }

    /// Wrap a closure as a transaction-dependent listener
    pub fn transaction_fn<F>(f: F) -> Self
    where
        F: Fn(&TransactionDependentScope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Delegate::TransactionDependent(Arc::new(FnTransactionListener(f)))
    }

    /// Wrap a closure as a custom-properties resolver
    pub fn properties_fn<F>(f: F) -> Self
    where
        F: Fn(&DelegateExecution<'_>) -> anyhow::Result<HashMap<String, Value>>
            + Send
            + Sync
            + 'static,
    {
        Delegate::PropertiesResolver(Arc::new(FnPropertiesResolver(f)))
    }

    /// Wrap a closure as a function bean
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&mut DelegateExecution<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Delegate::Function(Arc::new(f))
    }

    /// Capability name, used in resolution errors
    pub fn kind(&self) -> &'static str {
        match self {
            Delegate::ExecutionListener(_) => "execution listener",
            Delegate::TaskListener(_) => "task listener",
            Delegate::TransactionDependent(_) => "transaction-dependent listener",
            Delegate::PropertiesResolver(_) => "custom properties resolver",
            Delegate::Function(_) => "function",
            Delegate::Value(_) => "value",
        }
    }
}

impl fmt::Debug for Delegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delegate::Value(value) => write!(f, "Delegate::Value({})", value),
            other => write!(f, "Delegate({})", other.kind()),
        }
    }
}

struct FnExecutionListener<F>(F);

impl<F> ExecutionListener for FnExecutionListener<F>
where
    F: Fn(&mut DelegateExecution<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, execution: &mut DelegateExecution<'_>) -> anyhow::Result<()> {
        (self.0)(execution)
    }
}

struct FnTaskListener<F>(F);

impl<F> TaskListener for FnTaskListener<F>
where
    F: Fn(&mut DelegateTask<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, task: &mut DelegateTask<'_>) -> anyhow::Result<()> {
        (self.0)(task)
    }
}

struct FnTransactionListener<F>(F);

impl<F> TransactionDependentListener for FnTransactionListener<F>
where
    F: Fn(&TransactionDependentScope) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(&self, scope: &TransactionDependentScope) -> anyhow::Result<()> {
        (self.0)(scope)
    }
}

struct FnPropertiesResolver<F>(F);

impl<F> CustomPropertiesResolver for FnPropertiesResolver<F>
where
    F: Fn(&DelegateExecution<'_>) -> anyhow::Result<HashMap<String, Value>> + Send + Sync,
{
    fn resolve(&self, execution: &DelegateExecution<'_>) -> anyhow::Result<HashMap<String, Value>> {
        (self.0)(execution)
    }
}

/// How a listener is implemented
#[derive(Debug, Clone)]
pub enum ListenerImplementation {
    /// `${...}` evaluated for its effect on every notification
    Expression(String),
    /// `${...}` that must evaluate to a delegate with the required capability
    DelegateExpression(String),
    /// Name of a class registered in the delegate catalog
    Class(String),
    /// Pre-built delegate
    Instance(Delegate),
}

impl ListenerImplementation {
    /// Human readable description used in markers and errors
    pub fn describe(&self) -> String {
        match self {
            ListenerImplementation::Expression(expr) => format!("expression:{}", expr),
            ListenerImplementation::DelegateExpression(expr) => {
                format!("delegateExpression:{}", expr)
            }
            ListenerImplementation::Class(name) => format!("class:{}", name),
            ListenerImplementation::Instance(delegate) => format!("instance:{}", delegate.kind()),
        }
    }
}

/// Listener as declared on a definition element
#[derive(Debug, Clone)]
pub struct ListenerDescriptor {
    implementation: ListenerImplementation,
    on_transaction: Option<TransactionState>,
    custom_properties_resolver: Option<ListenerImplementation>,
}

impl ListenerDescriptor {
    /// Descriptor for any implementation kind
    pub fn new(implementation: ListenerImplementation) -> Self {
        Self {
            implementation,
            on_transaction: None,
            custom_properties_resolver: None,
        }
    }

    /// Fixed expression listener
    pub fn expression(expression: impl Into<String>) -> Self {
        Self::new(ListenerImplementation::Expression(expression.into()))
    }

    /// Delegate expression listener
    pub fn delegate_expression(expression: impl Into<String>) -> Self {
        Self::new(ListenerImplementation::DelegateExpression(expression.into()))
    }

    /// Class reference listener
    pub fn class(name: impl Into<String>) -> Self {
        Self::new(ListenerImplementation::Class(name.into()))
    }

    /// Pre-built listener instance
    pub fn instance(delegate: Delegate) -> Self {
        Self::new(ListenerImplementation::Instance(delegate))
    }

    /// Defer dispatch to the given transaction stage
    pub fn on_transaction(mut self, stage: TransactionState) -> Self {
        self.on_transaction = Some(stage);
        self
    }

    /// Resolve extra properties when scheduling a deferred dispatch
    pub fn custom_properties_resolver(mut self, resolver: ListenerImplementation) -> Self {
        self.custom_properties_resolver = Some(resolver);
        self
    }

    /// Implementation kind
    pub fn implementation(&self) -> &ListenerImplementation {
        &self.implementation
    }

    /// Transaction stage, for transaction-dependent listeners
    pub fn transaction_stage(&self) -> Option<TransactionState> {
        self.on_transaction
    }

    /// Optional custom-properties resolver
    pub fn properties_resolver(&self) -> Option<&ListenerImplementation> {
        self.custom_properties_resolver.as_ref()
    }
}

/// Live execution handle handed to synchronous listeners
///
/// Variable access goes through the execution tree; event delivery and
/// triggers run nested interpretation that completes before the call returns.
pub struct DelegateExecution<'a> {
    pub(crate) engine: &'a mut ProcessEngine,
    pub(crate) tx: &'a mut TransactionContext,
    pub(crate) execution: ExecutionId,
    pub(crate) event: String,
}

impl<'a> DelegateExecution<'a> {
    /// Execution the event fired on
    pub fn id(&self) -> ExecutionId {
        self.execution
    }

    /// Process instance of the execution
    pub fn process_instance_id(&self) -> ExecutionId {
        self.engine
            .tree
            .get(self.execution)
            .map(|exec| exec.process_instance_id())
            .unwrap_or(self.execution)
    }

    /// Current activity of the execution
    pub fn current_activity_id(&self) -> Option<String> {
        self.engine
            .tree
            .get(self.execution)
            .and_then(|exec| exec.activity_id().map(str::to_string))
    }

    /// Event being dispatched
    pub fn event_name(&self) -> &str {
        &self.event
    }

    /// Listener currently marked on the execution
    pub fn current_listener(&self) -> Option<CurrentListener> {
        self.engine
            .tree
            .get(self.execution)
            .and_then(|exec| exec.current_listener().cloned())
    }

    /// Read a variable visible from this execution
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.engine.tree.variable(self.execution, name).cloned()
    }

    /// All variables visible from this execution
    pub fn variables(&self) -> HashMap<String, Value> {
        self.engine.tree.variables(self.execution)
    }

    /// Write a variable following the engine's write rule
    pub fn set_variable(&mut self, name: &str, value: Value) -> Result<()> {
        self.engine.tree.set_variable(self.execution, name, value)
    }

    /// Write a variable on this execution only
    pub fn set_variable_local(&mut self, name: &str, value: Value) -> Result<()> {
        self.engine
            .tree
            .set_variable_local(self.execution, name, value)
    }

    /// Deliver an event; matching executions are resumed before this returns
    pub fn event_received(
        &mut self,
        kind: EventKind,
        name: &str,
        target: Option<ExecutionId>,
        payload: Option<HashMap<String, Value>>,
    ) -> Result<Vec<ExecutionId>> {
        self.engine
            .event_received(kind, name, target, payload, self.tx)
    }

    /// Resume another waiting execution
    pub fn trigger(&mut self, execution: ExecutionId) -> Result<()> {
        self.engine.trigger(execution, HashMap::new(), self.tx)
    }

    /// Take a transition out of this execution's current activity
    pub fn take(&mut self, transition_id: &str) -> Result<()> {
        self.engine.take(self.execution, transition_id, self.tx)
    }

    /// Create a concurrent execution next to or below this one
    pub fn create_execution(&mut self) -> Result<ExecutionId> {
        self.engine.create_execution(self.execution)
    }

    /// Transaction the current operation runs in
    pub fn transaction(&mut self) -> &mut TransactionContext {
        self.tx
    }
}

/// Live task handle handed to synchronous task listeners
pub struct DelegateTask<'a> {
    pub(crate) engine: &'a mut ProcessEngine,
    pub(crate) tx: &'a mut TransactionContext,
    pub(crate) task: TaskId,
    pub(crate) execution: ExecutionId,
    pub(crate) event: TaskEvent,
}

impl<'a> DelegateTask<'a> {
    /// Task id
    pub fn id(&self) -> TaskId {
        self.task
    }

    /// Task event being dispatched
    pub fn event(&self) -> TaskEvent {
        self.event
    }

    /// Task entity, absent once deleted
    pub fn task(&self) -> Option<&Task> {
        self.engine.task(self.task)
    }

    /// Current assignee
    pub fn assignee(&self) -> Option<String> {
        self.task().and_then(|task| task.assignee().map(str::to_string))
    }

    /// Reassign the task; assignment listeners run before this returns
    pub fn set_assignee(&mut self, assignee: Option<String>) -> Result<()> {
        self.engine.set_assignee(self.task, assignee, self.tx)
    }

    /// Execution the task belongs to
    pub fn execution_id(&self) -> ExecutionId {
        self.execution
    }

    /// Read a variable visible from the task's execution
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.engine.tree.variable(self.execution, name).cloned()
    }

    /// Write a variable through the task's execution
    pub fn set_variable(&mut self, name: &str, value: Value) -> Result<()> {
        self.engine.tree.set_variable(self.execution, name, value)
    }

    /// Borrow the owning execution as a delegate handle
    pub fn execution(&mut self) -> DelegateExecution<'_> {
        DelegateExecution {
            engine: self.engine,
            tx: self.tx,
            execution: self.execution,
            event: self.event.to_string(),
        }
    }
}
