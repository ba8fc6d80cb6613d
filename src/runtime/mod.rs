//! Process engine and public API
//!
//! [`ProcessEngine`] owns the deployed definitions, the execution trees of all
//! running instances, open tasks and the agenda. The subscription registry and
//! delegate catalog are shared behind `Arc`s so callers can register beans and
//! inspect subscriptions without going through the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

// Submodules
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod expression;
pub mod graph;
pub mod interpreter;
pub mod listener;
pub mod operation;
pub mod registry;
pub mod subscription;
pub mod task;
pub mod transaction;

pub use dispatcher::TransactionDependentScope;
pub use error::{EngineError, Result};
pub use execution::{CurrentListener, Execution, ExecutionId, ExecutionTree};
pub use graph::{Activity, Behavior, ProcessDefinition, ProcessDefinitionBuilder, Transition};
pub use listener::{
    CustomPropertiesResolver, Delegate, DelegateExecution, DelegateTask, ExecutionEvent,
    ExecutionListener, ListenerDescriptor, ListenerImplementation, TaskEvent, TaskListener,
    TransactionDependentListener,
};
pub use registry::DelegateCatalog;
pub use subscription::{EventKind, EventSubscription, EventSubscriptionRegistry, SubscriptionId};
pub use task::{Task, TaskId};
pub use transaction::{TransactionContext, TransactionReport, TransactionState, TransactionStatus};

use operation::Agenda;

/// Configuration for a process engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine name, used in logs
    pub name: String,

    /// Maximum number of operations one drain of the agenda may run (0 = unlimited)
    pub operation_limit: usize,

    /// Log every interpreter step at debug level
    pub trace_operations: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "braid".to_string(),
            operation_limit: 1_000_000,
            trace_operations: false,
        }
    }
}

/// The process engine
pub struct ProcessEngine {
    pub(crate) config: EngineConfig,
    pub(crate) catalog: Arc<DelegateCatalog>,
    pub(crate) subscriptions: Arc<EventSubscriptionRegistry>,
    pub(crate) definitions: HashMap<String, Vec<Arc<ProcessDefinition>>>,
    pub(crate) tree: ExecutionTree,
    pub(crate) agenda: Agenda,
    pub(crate) suspended: Vec<Agenda>,
    pub(crate) tasks: Vec<Task>,
    pub(crate) operations_executed: u64,
}

impl ProcessEngine {
    /// Create an engine with the given configuration
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(engine = %config.name, "Process engine created");
        Ok(Self {
            config,
            catalog: Arc::new(DelegateCatalog::new()),
            subscriptions: Arc::new(EventSubscriptionRegistry::new()),
            definitions: HashMap::new(),
            tree: ExecutionTree::new(),
            agenda: Agenda::new(),
            suspended: Vec::new(),
            tasks: Vec::new(),
            operations_executed: 0,
        })
    }

    /// Current configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Delegate catalog that expressions and class references resolve against
    pub fn catalog(&self) -> &Arc<DelegateCatalog> {
        &self.catalog
    }

    /// Event subscription registry
    pub fn subscriptions(&self) -> &Arc<EventSubscriptionRegistry> {
        &self.subscriptions
    }

    /// Execution arena
    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    /// Total number of interpreter steps run so far
    pub fn operations_executed(&self) -> u64 {
        self.operations_executed
    }

    /// Deploy a definition; redeploying a key creates the next version
    pub fn deploy(&mut self, mut definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let versions = self.definitions.entry(definition.key().to_string()).or_default();
        definition.version = versions.len() as u32 + 1;
        let definition = Arc::new(definition);
        versions.push(definition.clone());
        tracing::info!(
            definition = definition.key(),
            version = definition.version(),
            "Deployed process definition"
        );
        definition
    }

    /// Latest deployed version of `key`
    pub fn definition(&self, key: &str) -> Result<Arc<ProcessDefinition>> {
        self.definitions
            .get(key)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| EngineError::not_found("process definition", key))
    }

    /// Create an unstarted process instance of the latest version of `key`
    pub fn create_process_instance(
        &mut self,
        key: &str,
        variables: HashMap<String, Value>,
    ) -> Result<ExecutionId> {
        let definition = self.definition(key)?;
        let root = self.tree.create_root(definition);
        for (name, value) in variables {
            self.tree.set_variable_local(root, &name, value)?;
        }
        Ok(root)
    }

    /// Create and start a process instance
    pub fn start_process_instance(
        &mut self,
        key: &str,
        variables: HashMap<String, Value>,
        tx: &mut TransactionContext,
    ) -> Result<ExecutionId> {
        let root = self.create_process_instance(key, variables)?;
        self.start(root, tx)?;
        Ok(root)
    }

    /// Look up an execution, ended or not
    pub fn execution(&self, id: ExecutionId) -> Option<&Execution> {
        self.tree.get(id)
    }

    /// Start a filtered query over live executions
    pub fn execution_query(&self) -> ExecutionQuery<'_> {
        ExecutionQuery {
            tree: &self.tree,
            process_instance_id: None,
            activity_id: None,
            active_only: false,
        }
    }

    /// Read a variable visible from `execution`
    pub fn variable(&self, execution: ExecutionId, name: &str) -> Option<&Value> {
        self.tree.variable(execution, name)
    }

    /// All variables visible from `execution`
    pub fn variables(&self, execution: ExecutionId) -> HashMap<String, Value> {
        self.tree.variables(execution)
    }

    /// Write a variable: to the nearest execution holding it, else the process instance
    pub fn set_variable(&mut self, execution: ExecutionId, name: &str, value: Value) -> Result<()> {
        self.tree.set_variable(execution, name, value)
    }

    /// Write a variable on `execution` itself
    pub fn set_variable_local(
        &mut self,
        execution: ExecutionId,
        name: &str,
        value: Value,
    ) -> Result<()> {
        self.tree.set_variable_local(execution, name, value)
    }

    /// Run `f` in a fresh transaction: commit on `Ok`, roll back on `Err`
    pub fn run_in_transaction<T, F>(&mut self, f: F) -> Result<(T, TransactionReport)>
    where
        F: FnOnce(&mut Self, &mut TransactionContext) -> Result<T>,
    {
        let mut tx = TransactionContext::new();
        match f(self, &mut tx) {
            Ok(value) => {
                let report = tx.commit()?;
                Ok((value, report))
            }
            Err(err) => {
                tracing::debug!(transaction = %tx.id(), error = %err, "Rolling back");
                tx.rollback();
                Err(err)
            }
        }
    }
}

/// Builder-style filter over live executions; filters combine with AND
pub struct ExecutionQuery<'a> {
    tree: &'a ExecutionTree,
    process_instance_id: Option<ExecutionId>,
    activity_id: Option<String>,
    active_only: bool,
}

impl<'a> ExecutionQuery<'a> {
    /// Filter by process instance
    pub fn process_instance_id(mut self, instance: ExecutionId) -> Self {
        self.process_instance_id = Some(instance);
        self
    }

    /// Filter by current activity
    pub fn activity_id(mut self, activity: impl Into<String>) -> Self {
        self.activity_id = Some(activity.into());
        self
    }

    /// Only active executions
    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    fn matches(&self, exec: &Execution) -> bool {
        self.process_instance_id
            .is_none_or(|instance| exec.process_instance_id() == instance)
            && self
                .activity_id
                .as_deref()
                .is_none_or(|activity| exec.activity_id() == Some(activity))
            && (!self.active_only || exec.is_active())
    }

    /// Matching executions in creation order
    pub fn list(&self) -> Vec<&'a Execution> {
        self.tree.iter_live().filter(|exec| self.matches(exec)).collect()
    }

    /// Number of matching executions
    pub fn count(&self) -> usize {
        self.tree.iter_live().filter(|exec| self.matches(exec)).count()
    }

    /// The single match, if any; more than one match is an error
    pub fn single_result(&self) -> Result<Option<&'a Execution>> {
        let mut matches = self.list();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            count => Err(EngineError::NonUniqueResult {
                entity: "execution",
                count,
            }),
        }
    }
}
