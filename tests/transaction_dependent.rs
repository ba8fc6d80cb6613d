//! Integration tests for listeners deferred to a transaction stage

mod common;

use braid::runtime::{
    Behavior, Delegate, EngineError, ExecutionEvent, ExecutionId, ListenerDescriptor,
    ListenerImplementation, ProcessDefinition, ProcessDefinitionBuilder, TaskEvent,
    TransactionDependentScope, TransactionState,
};
use common::{Recorder, engine};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn staged(recorder: &Recorder) -> ProcessDefinition {
    ProcessDefinitionBuilder::new("staged")
        .activity("start", Behavior::NoneStart)
        .activity("A", Behavior::Wait)
        .execution_listener(
            ExecutionEvent::End,
            ListenerDescriptor::instance(recorder.transaction_listener("committed"))
                .on_transaction(TransactionState::Committed),
        )
        .execution_listener(
            ExecutionEvent::End,
            ListenerDescriptor::instance(recorder.transaction_listener("rolled-back"))
                .on_transaction(TransactionState::RolledBack),
        )
        .execution_listener(ExecutionEvent::End, recorder.execution_listener("sync"))
        .activity("B", Behavior::Wait)
        .flow("f1", "start", "A")
        .flow("f2", "A", "B")
        .build()
        .unwrap()
}

fn start_staged(recorder: &Recorder) -> (braid::ProcessEngine, ExecutionId) {
    let mut engine = engine();
    engine.deploy(staged(recorder));
    let (instance, _) = engine
        .run_in_transaction(|engine, tx| engine.start_process_instance("staged", HashMap::new(), tx))
        .unwrap();
    (engine, instance)
}

#[test]
fn test_committed_listener_runs_only_after_commit() {
    let recorder = Recorder::new();
    let (mut engine, instance) = start_staged(&recorder);

    let observer = recorder.clone();
    let (_, report) = engine
        .run_in_transaction(|engine, tx| {
            engine.trigger(instance, HashMap::new(), tx)?;
            // scheduled, not yet run
            observer.push(format!("pending:{}", tx.pending(TransactionState::Committed)));
            Ok(())
        })
        .unwrap();

    assert_eq!(
        recorder.entries(),
        vec!["sync:end@A", "pending:1", "committed:committed"]
    );
    assert_eq!(report.executed, 1);
    assert!(report.is_clean());
}

#[test]
fn test_rolled_back_listener_runs_only_after_rollback() {
    let recorder = Recorder::new();
    let (mut engine, instance) = start_staged(&recorder);

    let result: Result<((), _), EngineError> = engine.run_in_transaction(|engine, tx| {
        engine.trigger(instance, HashMap::new(), tx)?;
        Err(EngineError::illegal_state("caller aborted"))
    });

    assert!(matches!(result, Err(EngineError::IllegalState(_))));
    assert_eq!(
        recorder.entries(),
        vec!["sync:end@A", "rolled-back:rolled-back"]
    );
}

#[test]
fn test_before_commit_failure_vetoes_commit() {
    let recorder = Recorder::new();
    let definition = ProcessDefinitionBuilder::new("veto")
        .activity("start", Behavior::NoneStart)
        .execution_listener(
            ExecutionEvent::End,
            ListenerDescriptor::instance(Delegate::transaction_fn(|_| {
                anyhow::bail!("ledger closed")
            }))
            .on_transaction(TransactionState::BeforeCommit),
        )
        .execution_listener(
            ExecutionEvent::End,
            ListenerDescriptor::instance(recorder.transaction_listener("after"))
                .on_transaction(TransactionState::Committed),
        )
        .execution_listener(
            ExecutionEvent::End,
            ListenerDescriptor::instance(recorder.transaction_listener("undo"))
                .on_transaction(TransactionState::RolledBack),
        )
        .activity("A", Behavior::Wait)
        .flow("f1", "start", "A")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(definition);

    let err = engine
        .run_in_transaction(|engine, tx| engine.start_process_instance("veto", HashMap::new(), tx))
        .unwrap_err();
    match err {
        EngineError::ListenerInvocation { event, source, .. } => {
            assert_eq!(event, "before-commit");
            assert!(format!("{:#}", source).contains("ledger closed"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(recorder.entries(), vec!["undo:rolled-back"]);
}

#[test]
fn test_failing_committed_listener_is_reported_not_raised() {
    let definition = ProcessDefinitionBuilder::new("noisy")
        .activity("start", Behavior::NoneStart)
        .execution_listener(
            ExecutionEvent::End,
            ListenerDescriptor::instance(Delegate::transaction_fn(|_| {
                anyhow::bail!("mail server down")
            }))
            .on_transaction(TransactionState::Committed),
        )
        .activity("A", Behavior::Wait)
        .flow("f1", "start", "A")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(definition);

    let (_, report) = engine
        .run_in_transaction(|engine, tx| engine.start_process_instance("noisy", HashMap::new(), tx))
        .unwrap();
    assert_eq!(report.executed, 1);
    assert_eq!(report.failures.len(), 1);
    assert!(format!("{:#}", report.failures[0]).contains("mail server down"));
}

#[test]
fn test_scope_snapshot_is_frozen_at_scheduling_time() {
    let captured: Arc<Mutex<Option<TransactionDependentScope>>> = Arc::new(Mutex::new(None));
    let sink = captured.clone();
    let definition = ProcessDefinitionBuilder::new("snapshot")
        .activity("start", Behavior::NoneStart)
        .activity("A", Behavior::Wait)
        .execution_listener(
            ExecutionEvent::End,
            ListenerDescriptor::instance(Delegate::transaction_fn(move |scope| {
                *sink.lock() = Some(scope.clone());
                Ok(())
            }))
            .on_transaction(TransactionState::Committed)
            .custom_properties_resolver(ListenerImplementation::Instance(
                Delegate::properties_fn(|execution| {
                    let user = execution.variable("user").unwrap_or_default();
                    Ok(HashMap::from([("notify".to_string(), user)]))
                }),
            )),
        )
        .activity("B", Behavior::Wait)
        .execution_listener(
            ExecutionEvent::Start,
            ListenerDescriptor::instance(Delegate::execution_fn(|execution| {
                execution.set_variable("user", json!("changed"))?;
                Ok(())
            })),
        )
        .flow("f1", "start", "A")
        .flow("f2", "A", "B")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(definition);

    let (instance, _) = engine
        .run_in_transaction(|engine, tx| {
            let instance = engine.start_process_instance(
                "snapshot",
                HashMap::from([("user".to_string(), json!("gonzo"))]),
                tx,
            )?;
            engine.trigger(instance, HashMap::new(), tx)?;
            Ok(instance)
        })
        .unwrap();

    let scope = captured.lock().clone().expect("listener ran");
    assert_eq!(scope.process_instance_id, instance);
    assert_eq!(scope.execution_id, instance);
    assert_eq!(scope.activity_id.as_deref(), Some("A"));
    assert_eq!(scope.event, "end");
    assert_eq!(scope.stage, TransactionState::Committed);
    assert_eq!(scope.variables.get("user"), Some(&json!("gonzo")));
    assert_eq!(scope.custom_properties.get("notify"), Some(&json!("gonzo")));
    assert!(scope.task.is_none());
    assert_eq!(engine.variable(instance, "user"), Some(&json!("changed")));
}

#[test]
fn test_task_event_scope_carries_task_snapshot() {
    let captured: Arc<Mutex<Vec<TransactionDependentScope>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    let definition = ProcessDefinitionBuilder::new("signoff")
        .activity("start", Behavior::NoneStart)
        .activity(
            "sign",
            Behavior::UserTask {
                assignee: Some("animal".to_string()),
            },
        )
        .task_listener(
            TaskEvent::Complete,
            ListenerDescriptor::instance(Delegate::transaction_fn(move |scope| {
                sink.lock().push(scope.clone());
                Ok(())
            }))
            .on_transaction(TransactionState::Committed),
        )
        .activity("done", Behavior::Wait)
        .flow("f1", "start", "sign")
        .flow("f2", "sign", "done")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(definition);

    let (task, _) = engine
        .run_in_transaction(|engine, tx| {
            let instance = engine.start_process_instance("signoff", HashMap::new(), tx)?;
            let task = engine
                .task_query()
                .process_instance_id(instance)
                .single_result()?
                .map(|task| task.id())
                .ok_or_else(|| EngineError::not_found("task", instance))?;
            engine.complete_task(task, HashMap::new(), tx)?;
            Ok(task)
        })
        .unwrap();

    let scopes = captured.lock();
    assert_eq!(scopes.len(), 1);
    let snapshot = scopes[0].task.as_ref().expect("task snapshot");
    assert_eq!(snapshot.id(), task);
    assert_eq!(snapshot.assignee(), Some("animal"));
    assert_eq!(scopes[0].event, "complete");
    assert!(engine.task(task).is_none());
}

#[test]
fn test_deferred_listeners_resolve_through_catalog() {
    let recorder = Recorder::new();
    let definition = ProcessDefinitionBuilder::new("beans")
        .activity("start", Behavior::NoneStart)
        .execution_listener(
            ExecutionEvent::End,
            ListenerDescriptor::delegate_expression("${notifier}")
                .on_transaction(TransactionState::Committed),
        )
        .activity("A", Behavior::Wait)
        .flow("f1", "start", "A")
        .build()
        .unwrap();
    let mut engine = engine();
    engine
        .catalog()
        .register_bean("notifier", recorder.transaction_listener("notifier"));
    engine.deploy(definition);

    engine
        .run_in_transaction(|engine, tx| engine.start_process_instance("beans", HashMap::new(), tx))
        .unwrap();
    assert_eq!(recorder.entries(), vec!["notifier:committed"]);
}

#[test]
fn test_fixed_expression_cannot_be_transaction_dependent() {
    let definition = ProcessDefinitionBuilder::new("fixed")
        .activity("start", Behavior::NoneStart)
        .execution_listener(
            ExecutionEvent::End,
            ListenerDescriptor::expression("${audit()}").on_transaction(TransactionState::Committed),
        )
        .activity("A", Behavior::Wait)
        .flow("f1", "start", "A")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(definition);

    let err = engine
        .run_in_transaction(|engine, tx| engine.start_process_instance("fixed", HashMap::new(), tx))
        .unwrap_err();
    assert!(matches!(err, EngineError::DelegateResolution { .. }));
}
