//! Listener dispatch
//!
//! Synchronous listeners run on the spot with a live handle and a
//! current-listener marker that is cleared however the call ends.
//! Transaction-dependent listeners are resolved immediately but run later:
//! their inputs are frozen into a [`TransactionDependentScope`] and handed to
//! the transaction context as a thunk for the requested stage.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::ProcessEngine;
use super::error::{EngineError, Result};
use super::execution::{CurrentListener, ExecutionId};
use super::expression::{Expression, Resolved};
use super::listener::{
    Delegate, DelegateExecution, DelegateTask, ExecutionEvent, ListenerDescriptor,
    ListenerImplementation, TaskEvent,
};
use super::task::{Task, TaskId};
use super::transaction::{TransactionContext, TransactionState};

/// Snapshot handed to transaction-dependent listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDependentScope {
    /// Process instance the event happened in
    pub process_instance_id: ExecutionId,
    /// Execution the event fired on
    pub execution_id: ExecutionId,
    /// Activity the execution was positioned on
    pub activity_id: Option<String>,
    /// Task the event belongs to, for task events
    pub task: Option<Task>,
    /// Event name
    pub event: String,
    /// Stage the listener was registered for
    pub stage: TransactionState,
    /// Variables visible from the execution when the listener was scheduled
    pub variables: HashMap<String, Value>,
    /// Properties computed by the custom-properties resolver
    pub custom_properties: HashMap<String, Value>,
}

fn resolution_error(implementation: &ListenerImplementation, detail: impl Into<String>) -> EngineError {
    EngineError::DelegateResolution {
        implementation: implementation.describe(),
        detail: detail.into(),
    }
}

impl ProcessEngine {
    /// Resolve a non-expression implementation to its delegate
    fn resolve_delegate(
        &mut self,
        execution: ExecutionId,
        event: &str,
        implementation: &ListenerImplementation,
        tx: &mut TransactionContext,
    ) -> Result<Delegate> {
        match implementation {
            ListenerImplementation::Instance(delegate) => Ok(delegate.clone()),
            ListenerImplementation::Class(name) => self.catalog.instantiate(name),
            ListenerImplementation::DelegateExpression(source) => {
                let expression = Expression::parse(source)?;
                let mut delegate_execution = DelegateExecution {
                    engine: self,
                    tx,
                    execution,
                    event: event.to_string(),
                };
                match expression.evaluate(&mut delegate_execution)? {
                    Resolved::Delegate(delegate) => Ok(delegate),
                    Resolved::Value(value) => Err(resolution_error(
                        implementation,
                        format!("expression evaluated to value {} instead of a delegate", value),
                    )),
                }
            }
            ListenerImplementation::Expression(_) => Err(resolution_error(
                implementation,
                "fixed expressions do not resolve to a delegate",
            )),
        }
    }

    fn evaluate_for_effect(
        &mut self,
        execution: ExecutionId,
        event: &str,
        source: &str,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let expression = Expression::parse(source)?;
        let mut delegate_execution = DelegateExecution {
            engine: self,
            tx,
            execution,
            event: event.to_string(),
        };
        expression.evaluate(&mut delegate_execution)?;
        Ok(())
    }

    fn set_execution_marker(&mut self, execution: ExecutionId, marker: Option<CurrentListener>) {
        if let Some(exec) = self.tree.get_mut(execution) {
            exec.current_listener = marker;
        }
    }

    /// Dispatch one execution listener
    pub(crate) fn fire_execution_listener(
        &mut self,
        execution: ExecutionId,
        event: ExecutionEvent,
        descriptor: &ListenerDescriptor,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let event_name = event.to_string();
        if let Some(stage) = descriptor.transaction_stage() {
            return self.schedule_transaction_dependent(
                execution, &event_name, None, descriptor, stage, tx,
            );
        }

        let implementation = descriptor.implementation();
        let description = implementation.describe();
        tracing::trace!(
            execution = %execution,
            event = %event_name,
            listener = %description,
            "Invoking execution listener"
        );

        let previous = self.tree.get(execution).and_then(|exec| exec.current_listener.clone());
        self.set_execution_marker(
            execution,
            Some(CurrentListener {
                event: event_name.clone(),
                listener: description.clone(),
            }),
        );
        let result = self.invoke_execution_listener(execution, &event_name, implementation, tx);
        self.set_execution_marker(execution, previous);

        result.map_err(|err| wrap_listener_error(err, &description, &event_name))
    }

    fn invoke_execution_listener(
        &mut self,
        execution: ExecutionId,
        event: &str,
        implementation: &ListenerImplementation,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        if let ListenerImplementation::Expression(source) = implementation {
            return self.evaluate_for_effect(execution, event, source, tx);
        }
        let Delegate::ExecutionListener(listener) =
            self.resolve_delegate(execution, event, implementation, tx)?
        else {
            return Err(resolution_error(implementation, "not an execution listener"));
        };
        let mut delegate_execution = DelegateExecution {
            engine: self,
            tx,
            execution,
            event: event.to_string(),
        };
        listener
            .notify(&mut delegate_execution)
            .map_err(|source| EngineError::ListenerInvocation {
                listener: implementation.describe(),
                event: event.to_string(),
                source,
            })
    }

    /// Dispatch every task listener of the task's activity registered for `event`
    pub(crate) fn fire_task_listeners(
        &mut self,
        task_id: TaskId,
        event: TaskEvent,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let Some(task) = self.task(task_id) else {
            return Err(EngineError::not_found("task", task_id));
        };
        let execution = task.execution_id();
        let activity_id = task.activity_id().to_string();
        let definition = self.tree.get(execution).map(|exec| exec.definition().clone()).ok_or_else(
            || EngineError::not_found("execution", execution),
        )?;
        let activity = definition.require_activity(&activity_id)?;
        let event_name = event.to_string();

        for (registered, descriptor) in activity.task_listeners() {
            if !registered.matches(event) {
                continue;
            }
            if let Some(stage) = descriptor.transaction_stage() {
                let snapshot = self.task(task_id).cloned();
                self.schedule_transaction_dependent(
                    execution, &event_name, snapshot, descriptor, stage, tx,
                )?;
                continue;
            }

            let implementation = descriptor.implementation();
            let description = implementation.describe();
            let previous = self
                .task(task_id)
                .and_then(|task| task.current_listener().cloned());
            self.set_task_marker(
                task_id,
                Some(CurrentListener {
                    event: event_name.clone(),
                    listener: description.clone(),
                }),
            );
            let result = self.invoke_task_listener(task_id, execution, event, implementation, tx);
            self.set_task_marker(task_id, previous);
            result.map_err(|err| wrap_listener_error(err, &description, &event_name))?;
        }
        Ok(())
    }

    fn invoke_task_listener(
        &mut self,
        task: TaskId,
        execution: ExecutionId,
        event: TaskEvent,
        implementation: &ListenerImplementation,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let event_name = event.to_string();
        if let ListenerImplementation::Expression(source) = implementation {
            return self.evaluate_for_effect(execution, &event_name, source, tx);
        }
        let Delegate::TaskListener(listener) =
            self.resolve_delegate(execution, &event_name, implementation, tx)?
        else {
            return Err(resolution_error(implementation, "not a task listener"));
        };
        let mut delegate_task = DelegateTask {
            engine: self,
            tx,
            task,
            execution,
            event,
        };
        listener
            .notify(&mut delegate_task)
            .map_err(|source| EngineError::ListenerInvocation {
                listener: implementation.describe(),
                event: event_name,
                source,
            })
    }

    fn resolve_custom_properties(
        &mut self,
        execution: ExecutionId,
        event: &str,
        resolver: &ListenerImplementation,
        tx: &mut TransactionContext,
    ) -> Result<HashMap<String, Value>> {
        let Delegate::PropertiesResolver(resolver_delegate) =
            self.resolve_delegate(execution, event, resolver, tx)?
        else {
            return Err(resolution_error(resolver, "not a custom properties resolver"));
        };
        let delegate_execution = DelegateExecution {
            engine: self,
            tx,
            execution,
            event: event.to_string(),
        };
        resolver_delegate
            .resolve(&delegate_execution)
            .map_err(|source| EngineError::ListenerInvocation {
                listener: resolver.describe(),
                event: event.to_string(),
                source,
            })
    }

    /// Freeze the listener's inputs and register it with the transaction
    fn schedule_transaction_dependent(
        &mut self,
        execution: ExecutionId,
        event: &str,
        task: Option<Task>,
        descriptor: &ListenerDescriptor,
        stage: TransactionState,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let implementation = descriptor.implementation();
        if matches!(implementation, ListenerImplementation::Expression(_)) {
            return Err(resolution_error(
                implementation,
                "fixed expressions cannot be transaction dependent",
            ));
        }
        let Delegate::TransactionDependent(listener) =
            self.resolve_delegate(execution, event, implementation, tx)?
        else {
            return Err(resolution_error(
                implementation,
                "not a transaction-dependent listener",
            ));
        };

        let custom_properties = match descriptor.properties_resolver() {
            Some(resolver) => self.resolve_custom_properties(execution, event, resolver, tx)?,
            None => HashMap::new(),
        };

        let exec = self.tree.live(execution)?;
        let scope = TransactionDependentScope {
            process_instance_id: exec.process_instance_id(),
            execution_id: execution,
            activity_id: exec.activity_id().map(str::to_string),
            task,
            event: event.to_string(),
            stage,
            variables: self.tree.variables(execution),
            custom_properties,
        };
        let description = implementation.describe();
        tracing::debug!(
            execution = %execution,
            event = event,
            stage = %stage,
            listener = %description,
            "Scheduled transaction-dependent listener"
        );

        tx.add_transaction_listener(
            stage,
            Box::new(move || {
                listener.notify(&scope).map_err(|err| {
                    err.context(format!(
                        "listener '{}' failed on '{}' event at {}",
                        description, scope.event, scope.stage
                    ))
                })
            }),
        )
    }
}

/// Attach listener identity to errors raised below the listener boundary
fn wrap_listener_error(err: EngineError, listener: &str, event: &str) -> EngineError {
    match err {
        EngineError::ListenerInvocation { .. }
        | EngineError::DelegateResolution { .. }
        | EngineError::IllegalState(_)
        | EngineError::NotFound { .. }
        | EngineError::NonUniqueResult { .. } => err,
        other => EngineError::ListenerInvocation {
            listener: listener.to_string(),
            event: event.to_string(),
            source: anyhow::Error::new(other),
        },
    }
}
