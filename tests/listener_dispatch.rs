//! Integration tests for synchronous execution and task listener dispatch

mod common;

use braid::runtime::{
    Behavior, Delegate, DelegateExecution, EngineError, ExecutionEvent, ExecutionListener,
    ListenerDescriptor, ListenerImplementation, ProcessDefinitionBuilder, TaskEvent,
    TransactionContext,
};
use common::{Recorder, engine};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_listener_order_through_linear_process() {
    let recorder = Recorder::new();
    let definition = ProcessDefinitionBuilder::new("ordered")
        .execution_listener(ExecutionEvent::Start, recorder.execution_listener("process"))
        .execution_listener(ExecutionEvent::End, recorder.execution_listener("process"))
        .activity("start", Behavior::NoneStart)
        .execution_listener(ExecutionEvent::Start, recorder.execution_listener("activity"))
        .execution_listener(ExecutionEvent::End, recorder.execution_listener("activity"))
        .activity("A", Behavior::PassThrough)
        .execution_listener(ExecutionEvent::Start, recorder.execution_listener("activity"))
        .execution_listener(ExecutionEvent::End, recorder.execution_listener("activity"))
        .activity("end", Behavior::NoneEnd)
        .execution_listener(ExecutionEvent::End, recorder.execution_listener("activity"))
        .flow("f1", "start", "A")
        .execution_listener(ExecutionEvent::Take, recorder.execution_listener("transition"))
        .flow("f2", "A", "end")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(definition);
    let mut tx = TransactionContext::new();
    let instance = engine
        .start_process_instance("ordered", HashMap::new(), &mut tx)
        .unwrap();

    assert!(engine.execution(instance).unwrap().is_ended());
    assert_eq!(
        recorder.entries(),
        vec![
            "process:start@",
            "activity:start@start",
            "activity:end@start",
            "transition:take@start",
            "activity:start@A",
            "activity:end@A",
            "activity:end@end",
            "process:end@end",
        ]
    );
}

#[test]
fn test_nested_interpretation_completes_before_next_listener() {
    let recorder = Recorder::new();
    let other_definition = ProcessDefinitionBuilder::new("other")
        .activity("start", Behavior::NoneStart)
        .activity("W", Behavior::Wait)
        .execution_listener(ExecutionEvent::End, recorder.execution_listener("nested"))
        .activity("done", Behavior::Wait)
        .flow("f1", "start", "W")
        .flow("f2", "W", "done")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(other_definition);
    let mut tx = TransactionContext::new();
    let other = engine
        .start_process_instance("other", HashMap::new(), &mut tx)
        .unwrap();

    let trigger_recorder = recorder.clone();
    let definition = ProcessDefinitionBuilder::new("main")
        .activity("start", Behavior::NoneStart)
        .activity("A", Behavior::Wait)
        .execution_listener(ExecutionEvent::Start, recorder.execution_listener("L1"))
        .execution_listener(
            ExecutionEvent::Start,
            ListenerDescriptor::instance(Delegate::execution_fn(move |execution| {
                trigger_recorder.push("L2:start@A");
                execution.trigger(other)?;
                Ok(())
            })),
        )
        .execution_listener(ExecutionEvent::Start, recorder.execution_listener("L3"))
        .flow("f1", "start", "A")
        .build()
        .unwrap();
    engine.deploy(definition);
    let instance = engine
        .start_process_instance("main", HashMap::new(), &mut tx)
        .unwrap();

    assert_eq!(
        recorder.entries(),
        vec!["L1:start@A", "L2:start@A", "nested:end@W", "L3:start@A"]
    );
    assert_eq!(engine.execution(other).unwrap().activity_id(), Some("done"));
    assert_eq!(engine.execution(instance).unwrap().activity_id(), Some("A"));
}

#[test]
fn test_current_listener_marker_is_set_during_invocation_and_cleared_after_failure() {
    let seen = Recorder::new();
    let observer = seen.clone();
    let definition = ProcessDefinitionBuilder::new("marker")
        .activity("start", Behavior::NoneStart)
        .activity("A", Behavior::Wait)
        .execution_listener(
            ExecutionEvent::Start,
            ListenerDescriptor::instance(Delegate::execution_fn(move |execution| {
                let marker = execution.current_listener().expect("marker set");
                observer.push(format!("{}|{}", marker.event, marker.listener));
                Ok(())
            })),
        )
        .execution_listener(
            ExecutionEvent::End,
            ListenerDescriptor::instance(Delegate::execution_fn(|_| {
                anyhow::bail!("refusing to leave")
            })),
        )
        .activity("B", Behavior::Wait)
        .flow("f1", "start", "A")
        .flow("f2", "A", "B")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(definition);
    let mut tx = TransactionContext::new();
    let instance = engine
        .start_process_instance("marker", HashMap::new(), &mut tx)
        .unwrap();
    assert_eq!(seen.entries(), vec!["start|instance:execution listener"]);
    assert!(engine.execution(instance).unwrap().current_listener().is_none());

    let err = engine.trigger(instance, HashMap::new(), &mut tx).unwrap_err();
    match &err {
        EngineError::ListenerInvocation { listener, event, source } => {
            assert_eq!(listener, "instance:execution listener");
            assert_eq!(event, "end");
            assert!(source.to_string().contains("refusing to leave"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.is_listener_failure());
    assert!(engine.execution(instance).unwrap().current_listener().is_none());
}

#[derive(Default)]
struct CountingListener;

static CLASS_NOTIFICATIONS: AtomicUsize = AtomicUsize::new(0);

impl ExecutionListener for CountingListener {
    fn notify(&self, execution: &mut DelegateExecution<'_>) -> anyhow::Result<()> {
        CLASS_NOTIFICATIONS.fetch_add(1, Ordering::SeqCst);
        execution.set_variable("counted", json!(true))?;
        Ok(())
    }
}

#[test]
fn test_implementation_kinds_resolve_through_catalog() {
    let recorder = Recorder::new();
    let definition = ProcessDefinitionBuilder::new("kinds")
        .activity("start", Behavior::NoneStart)
        .activity("A", Behavior::Wait)
        .execution_listener(ExecutionEvent::Start, ListenerDescriptor::class("counting"))
        .execution_listener(
            ExecutionEvent::Start,
            ListenerDescriptor::delegate_expression("${auditor}"),
        )
        .execution_listener(ExecutionEvent::Start, ListenerDescriptor::expression("${mark()}"))
        .flow("f1", "start", "A")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.catalog().register_execution_listener::<CountingListener>("counting");
    engine
        .catalog()
        .register_bean("auditor", {
            let recorder = recorder.clone();
            Delegate::execution_fn(move |execution| {
                recorder.push(format!("auditor:{}", execution.event_name()));
                Ok(())
            })
        });
    engine.catalog().register_bean(
        "mark",
        Delegate::function(|execution| {
            execution.set_variable_local("marked", json!("yes"))?;
            Ok(Value::Null)
        }),
    );
    engine.deploy(definition);
    let mut tx = TransactionContext::new();
    let before = CLASS_NOTIFICATIONS.load(Ordering::SeqCst);
    let instance = engine
        .start_process_instance("kinds", HashMap::new(), &mut tx)
        .unwrap();

    assert_eq!(CLASS_NOTIFICATIONS.load(Ordering::SeqCst), before + 1);
    assert_eq!(engine.variable(instance, "counted"), Some(&json!(true)));
    assert_eq!(recorder.entries(), vec!["auditor:start"]);
    assert_eq!(engine.variable(instance, "marked"), Some(&json!("yes")));
}

fn single_listener_process(descriptor: ListenerDescriptor) -> braid::runtime::ProcessDefinition {
    ProcessDefinitionBuilder::new("single")
        .activity("start", Behavior::NoneStart)
        .activity("A", Behavior::Wait)
        .execution_listener(ExecutionEvent::Start, descriptor)
        .flow("f1", "start", "A")
        .build()
        .unwrap()
}

#[test]
fn test_unresolvable_delegates_are_resolution_errors() {
    let cases = [
        ListenerDescriptor::class("com.example.Missing"),
        ListenerDescriptor::delegate_expression("${threshold}"),
        ListenerDescriptor::delegate_expression("${taskOnly}"),
    ];
    for descriptor in cases {
        let mut engine = engine();
        engine.catalog().register_bean("threshold", Delegate::Value(json!(10)));
        engine
            .catalog()
            .register_bean("taskOnly", Delegate::task_fn(|_| Ok(())));
        engine.deploy(single_listener_process(descriptor.clone()));
        let mut tx = TransactionContext::new();

        let err = engine
            .start_process_instance("single", HashMap::new(), &mut tx)
            .unwrap_err();
        match err {
            EngineError::DelegateResolution { implementation, .. } => {
                assert_eq!(implementation, descriptor.implementation().describe());
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}

#[test]
fn test_unknown_expression_property_surfaces_as_listener_failure() {
    let mut engine = engine();
    engine.deploy(single_listener_process(ListenerDescriptor::new(
        ListenerImplementation::Expression("${nobody.home}".to_string()),
    )));
    let mut tx = TransactionContext::new();

    let err = engine
        .start_process_instance("single", HashMap::new(), &mut tx)
        .unwrap_err();
    match err {
        EngineError::ListenerInvocation { listener, event, .. } => {
            assert_eq!(listener, "expression:${nobody.home}");
            assert_eq!(event, "start");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

fn review_process(recorder: &Recorder, assignee: Option<&str>) -> braid::runtime::ProcessDefinition {
    ProcessDefinitionBuilder::new("review")
        .activity("start", Behavior::NoneStart)
        .activity(
            "review",
            Behavior::UserTask {
                assignee: assignee.map(str::to_string),
            },
        )
        .task_listener(TaskEvent::All, recorder.task_listener("all"))
        .task_listener(TaskEvent::Create, recorder.task_listener("create"))
        .task_listener(TaskEvent::Assignment, recorder.task_listener("assignment"))
        .task_listener(TaskEvent::Complete, recorder.task_listener("complete"))
        .task_listener(TaskEvent::Delete, recorder.task_listener("delete"))
        .activity("archive", Behavior::Wait)
        .flow("f1", "start", "review")
        .flow("f2", "review", "archive")
        .build()
        .unwrap()
}

#[test]
fn test_task_listeners_follow_task_lifecycle() {
    let recorder = Recorder::new();
    let mut engine = engine();
    engine.deploy(review_process(&recorder, Some("kermit")));
    let mut tx = TransactionContext::new();
    let instance = engine
        .start_process_instance("review", HashMap::new(), &mut tx)
        .unwrap();

    assert_eq!(
        recorder.entries(),
        vec![
            "all:create",
            "create:create",
            "all:assignment",
            "assignment:assignment",
        ]
    );
    let task = engine
        .task_query()
        .process_instance_id(instance)
        .single_result()
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(task.assignee(), Some("kermit"));
    assert_eq!(task.activity_id(), "review");

    engine
        .set_assignee(task.id(), Some("piggy".to_string()), &mut tx)
        .unwrap();
    engine
        .complete_task(task.id(), HashMap::from([("ok".to_string(), json!(true))]), &mut tx)
        .unwrap();

    assert_eq!(
        &recorder.entries()[4..],
        &[
            "all:assignment",
            "assignment:assignment",
            "all:complete",
            "complete:complete",
        ]
    );
    assert!(engine.task(task.id()).is_none());
    assert_eq!(engine.variable(instance, "ok"), Some(&json!(true)));
    assert_eq!(engine.execution(instance).unwrap().activity_id(), Some("archive"));
}

#[test]
fn test_cancelling_execution_deletes_task_with_listeners() {
    let recorder = Recorder::new();
    let mut engine = engine();
    engine.deploy(review_process(&recorder, None));
    let mut tx = TransactionContext::new();
    let instance = engine
        .start_process_instance("review", HashMap::new(), &mut tx)
        .unwrap();
    assert_eq!(recorder.entries(), vec!["all:create", "create:create"]);

    engine.end_execution(instance, &mut tx).unwrap();
    assert_eq!(
        &recorder.entries()[2..],
        &["all:delete", "delete:delete"]
    );
    assert_eq!(engine.task_query().count(), 0);
}

#[test]
fn test_task_listener_sees_task_marker_and_variables() {
    let recorder = Recorder::new();
    let observer = recorder.clone();
    let definition = ProcessDefinitionBuilder::new("approval")
        .activity("start", Behavior::NoneStart)
        .activity("approve", Behavior::user_task())
        .task_listener(
            TaskEvent::Complete,
            ListenerDescriptor::instance(Delegate::task_fn(move |task| {
                let marker = task
                    .task()
                    .and_then(|entity| entity.current_listener().cloned())
                    .expect("marker set");
                observer.push(format!("{}:{}", marker.event, marker.listener));
                let amount = task.variable("amount").unwrap_or(Value::Null);
                task.set_variable("approved", json!(amount.as_i64().unwrap_or(0) < 100))?;
                Ok(())
            })),
        )
        .activity("done", Behavior::Wait)
        .flow("f1", "start", "approve")
        .flow("f2", "approve", "done")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(definition);
    let mut tx = TransactionContext::new();
    let instance = engine
        .start_process_instance(
            "approval",
            HashMap::from([("amount".to_string(), json!(40))]),
            &mut tx,
        )
        .unwrap();

    let task = engine.task_query().single_result().unwrap().unwrap().id();
    engine.complete_task(task, HashMap::new(), &mut tx).unwrap();

    assert_eq!(recorder.entries(), vec!["complete:instance:task listener"]);
    assert_eq!(engine.variable(instance, "approved"), Some(&json!(true)));
}

#[test]
fn test_nested_task_event_restores_outer_marker() {
    let recorder = Recorder::new();
    let outer = recorder.clone();
    let inner = recorder.clone();
    let definition = ProcessDefinitionBuilder::new("delegation")
        .activity("start", Behavior::NoneStart)
        .activity("review", Behavior::user_task())
        .task_listener(
            TaskEvent::Create,
            ListenerDescriptor::instance(Delegate::task_fn(move |task| {
                task.set_assignee(Some("piggy".to_string()))?;
                let marker = task.task().and_then(|entity| entity.current_listener().cloned());
                outer.push(format!("after-assign:{:?}", marker.map(|m| m.event)));
                Ok(())
            })),
        )
        .task_listener(
            TaskEvent::Assignment,
            ListenerDescriptor::instance(Delegate::task_fn(move |task| {
                let marker = task.task().and_then(|entity| entity.current_listener().cloned());
                inner.push(format!("assignment:{:?}", marker.map(|m| m.event)));
                Ok(())
            })),
        )
        .activity("done", Behavior::Wait)
        .flow("f1", "start", "review")
        .flow("f2", "review", "done")
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(definition);
    let mut tx = TransactionContext::new();
    engine
        .start_process_instance("delegation", HashMap::new(), &mut tx)
        .unwrap();

    assert_eq!(
        recorder.entries(),
        vec![
            "assignment:Some(\"assignment\")",
            "after-assign:Some(\"create\")"
        ]
    );
    let task = engine.task_query().single_result().unwrap().unwrap();
    assert_eq!(task.assignee(), Some("piggy"));
    assert!(task.current_listener().is_none());
}

#[test]
fn test_conditions_and_default_flow_select_path() {
    let definition = ProcessDefinitionBuilder::new("routing")
        .activity("start", Behavior::NoneStart)
        .activity("route", Behavior::ExclusiveGateway)
        .activity("big", Behavior::Wait)
        .activity("small", Behavior::Wait)
        .flow("f0", "start", "route")
        .flow("f1", "route", "big")
        .condition("${amount >= 1000 && !manual}")
        .flow("f2", "route", "small")
        .default_flow()
        .build()
        .unwrap();
    let mut engine = engine();
    engine.deploy(definition);
    let mut tx = TransactionContext::new();

    for (amount, manual, expected) in [
        (5000, false, "big"),
        (5000, true, "small"),
        (10, false, "small"),
    ] {
        let instance = engine
            .start_process_instance(
                "routing",
                HashMap::from([
                    ("amount".to_string(), json!(amount)),
                    ("manual".to_string(), json!(manual)),
                ]),
                &mut tx,
            )
            .unwrap();
        assert_eq!(
            engine.execution(instance).unwrap().activity_id(),
            Some(expected),
            "amount {} manual {}",
            amount,
            manual
        );
    }
}
