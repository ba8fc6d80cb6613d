//! Operation interpreter
//!
//! Public entry points seed the agenda and then drain it in a loop: each
//! [`Step`] does one bounded piece of work and queues its follow-up instead of
//! calling it, so stack depth stays constant however long the path through the
//! graph is. Listener hooks are drained by a per-execution cursor, one listener
//! per step, re-queuing the step until the cursor runs off the end.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::ProcessEngine;
use super::error::{EngineError, Result};
use super::execution::ExecutionId;
use super::graph::{Activity, Behavior, ProcessDefinition, Transition};
use super::listener::{DelegateExecution, ExecutionEvent, ListenerDescriptor};
use super::operation::Step;
use super::subscription::EventKind;
use super::transaction::TransactionContext;

impl ProcessEngine {
    /// Run `seed` on a fresh agenda and drain it.
    ///
    /// The agenda of an outer interpretation (a listener calling back into the
    /// engine) is suspended for the duration and restored afterwards.
    pub(crate) fn interpret<F>(&mut self, tx: &mut TransactionContext, seed: F) -> Result<()>
    where
        F: FnOnce(&mut Self, &mut TransactionContext) -> Result<()>,
    {
        let outer = std::mem::take(&mut self.agenda);
        self.suspended.push(outer);
        let result = match seed(self, tx) {
            Ok(()) => self.drain(tx),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            tracing::debug!(
                dropped = self.agenda.len(),
                error = %err,
                "Interpretation failed; clearing agenda"
            );
            self.agenda.clear();
        }
        self.agenda = self.suspended.pop().unwrap_or_default();
        result
    }

    fn drain(&mut self, tx: &mut TransactionContext) -> Result<()> {
        let limit = self.config.operation_limit;
        let mut executed = 0usize;
        while let Some(op) = self.agenda.pop() {
            if !self.tree.is_live(op.execution) {
                tracing::warn!(
                    execution = %op.execution,
                    step = %op.step,
                    "Skipping operation queued for ended execution"
                );
                continue;
            }
            executed += 1;
            if limit > 0 && executed > limit {
                return Err(EngineError::illegal_state(format!(
                    "operation limit of {} exceeded",
                    limit
                )));
            }
            if self.config.trace_operations {
                tracing::debug!(execution = %op.execution, step = %op.step, "Advancing");
            }
            self.advance(op.execution, op.step, tx)?;
        }
        self.operations_executed += executed as u64;
        Ok(())
    }

    fn advance(
        &mut self,
        execution: ExecutionId,
        step: Step,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        match step {
            Step::ProcessStart => self.process_start(execution, tx),
            Step::NotifyStart => self.notify_start(execution, tx),
            Step::ExecuteActivity => self.execute_activity(execution, tx),
            Step::NotifyEnd => self.notify_end(execution, tx),
            Step::DestroyScope => self.destroy_scope(execution, tx),
            Step::NotifyTake => self.notify_take(execution, tx),
            Step::CreateScope => self.create_scope(execution),
            Step::ActivityEnd => self.activity_end(execution, tx),
            Step::ScopeEnd => self.scope_end(execution, tx),
            Step::ProcessEnd => self.process_end(execution, tx),
        }
    }

    fn definition_of(&self, execution: ExecutionId) -> Result<Arc<ProcessDefinition>> {
        Ok(self.tree.live(execution)?.definition().clone())
    }

    fn current_activity(&self, execution: ExecutionId) -> Result<String> {
        self.tree.live(execution)?.activity.clone().ok_or_else(|| {
            EngineError::illegal_state(format!(
                "execution {} is not positioned on an activity",
                execution
            ))
        })
    }

    fn pending_transition(&self, execution: ExecutionId) -> Result<String> {
        self.tree.live(execution)?.transition.clone().ok_or_else(|| {
            EngineError::illegal_state(format!(
                "execution {} is not taking a transition",
                execution
            ))
        })
    }

    /// Fire the listener under the cursor and re-queue `step`.
    ///
    /// Returns `true` once every listener has fired; the cursor is reset.
    fn notify_next(
        &mut self,
        execution: ExecutionId,
        listeners: &[ListenerDescriptor],
        event: ExecutionEvent,
        step: Step,
        tx: &mut TransactionContext,
    ) -> Result<bool> {
        let index = self.tree.live(execution)?.listener_index;
        let Some(descriptor) = listeners.get(index) else {
            self.tree.live_mut(execution)?.listener_index = 0;
            return Ok(true);
        };
        self.tree.live_mut(execution)?.listener_index = index + 1;
        self.agenda.push(execution, step);
        self.fire_execution_listener(execution, event, descriptor, tx)?;
        Ok(false)
    }

    fn process_start(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let listeners = definition.execution_listeners(ExecutionEvent::Start);
        if !self.notify_next(execution, listeners, ExecutionEvent::Start, Step::ProcessStart, tx)? {
            return Ok(());
        }
        self.enter_activity(execution, definition.initial())
    }

    /// Position `execution` on `activity_id`, opening a scope execution for scopes
    fn enter_activity(&mut self, execution: ExecutionId, activity_id: &str) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let activity = definition.require_activity(activity_id)?;
        let target = if activity.is_scope() {
            let child = self.tree.create_child(execution, true, false)?;
            let parent = self.tree.live_mut(execution)?;
            parent.activity = Some(activity_id.to_string());
            parent.active = false;
            child
        } else {
            execution
        };
        self.tree.live_mut(target)?.activity = Some(activity_id.to_string());
        self.agenda.push(target, Step::NotifyStart);
        Ok(())
    }

    fn notify_start(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let activity = definition.require_activity(&self.current_activity(execution)?)?;
        let listeners = activity.execution_listeners(ExecutionEvent::Start);
        if !self.notify_next(execution, listeners, ExecutionEvent::Start, Step::NotifyStart, tx)? {
            return Ok(());
        }
        self.tree.live_mut(execution)?.transition = None;
        self.agenda.push(execution, Step::ExecuteActivity);
        Ok(())
    }

    fn execute_activity(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let activity = definition.require_activity(&self.current_activity(execution)?)?;
        tracing::trace!(
            execution = %execution,
            activity = activity.id(),
            behavior = activity.behavior().tag(),
            "Executing activity"
        );

        match activity.behavior() {
            Behavior::NoneStart | Behavior::PassThrough => self.leave(execution, tx),
            Behavior::Wait => Ok(()),
            Behavior::UserTask { assignee } => {
                self.create_task(execution, activity, assignee.clone(), tx)?;
                Ok(())
            }
            Behavior::CatchEvent { kind, event_name } => {
                let waiting = self.tree.live(execution)?;
                self.subscriptions
                    .create_subscription(*kind, event_name, waiting, activity.id());
                Ok(())
            }
            Behavior::ParallelGateway => self.parallel_gateway(execution, activity, tx),
            Behavior::ExclusiveGateway => {
                self.exclusive_gateway(execution, &definition, activity, tx)
            }
            Behavior::SubProcess => {
                let initial = activity.initial().ok_or_else(|| {
                    EngineError::illegal_state(format!(
                        "scope '{}' has no initial activity",
                        activity.id()
                    ))
                })?;
                self.enter_activity(execution, initial)
            }
            Behavior::NoneEnd => {
                self.agenda.push(execution, Step::ActivityEnd);
                Ok(())
            }
        }
    }

    fn condition_holds(
        &mut self,
        execution: ExecutionId,
        transition: &Transition,
        tx: &mut TransactionContext,
    ) -> Result<bool> {
        let Some(condition) = transition.condition() else {
            return Ok(true);
        };
        let mut delegate = DelegateExecution {
            engine: self,
            tx,
            execution,
            event: ExecutionEvent::Take.to_string(),
        };
        condition.evaluate_condition(&mut delegate)
    }

    /// Leave the current activity through every outgoing transition whose
    /// condition holds; the default flow is used when none does.
    pub(crate) fn leave(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let activity_id = self.current_activity(execution)?;
        let outgoing = definition.outgoing(&activity_id);

        let mut selected = Vec::new();
        for transition in outgoing.iter().filter(|t| !t.is_default()) {
            if self.condition_holds(execution, transition, tx)? {
                selected.push(transition.id().to_string());
            }
        }
        if selected.is_empty() {
            selected.extend(
                outgoing
                    .iter()
                    .filter(|t| t.is_default())
                    .map(|t| t.id().to_string()),
            );
        }

        match selected.as_slice() {
            [] => {
                self.agenda.push(execution, Step::ActivityEnd);
                Ok(())
            }
            [single] => self.take_transition(execution, single, tx),
            _ => self.fork(execution, &selected, tx),
        }
    }

    fn exclusive_gateway(
        &mut self,
        execution: ExecutionId,
        definition: &ProcessDefinition,
        gateway: &Activity,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let outgoing = definition.outgoing(gateway.id());
        let mut chosen = None;
        for transition in outgoing.iter().filter(|t| !t.is_default()) {
            if self.condition_holds(execution, transition, tx)? {
                chosen = Some(transition.id());
                break;
            }
        }
        let chosen = chosen
            .or_else(|| outgoing.iter().find(|t| t.is_default()).map(|t| t.id()))
            .ok_or_else(|| {
                EngineError::illegal_state(format!(
                    "no outgoing transition of exclusive gateway '{}' can be taken",
                    gateway.id()
                ))
            })?;
        self.take_transition(execution, chosen, tx)
    }

    fn parallel_gateway(
        &mut self,
        execution: ExecutionId,
        gateway: &Activity,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let required = gateway.incoming().len();
        if required <= 1 {
            return self.leave(execution, tx);
        }

        let arriving = self.tree.live_mut(execution)?;
        arriving.active = false;
        let (is_concurrent, parent) = (arriving.is_concurrent, arriving.parent);
        let Some(parent) = parent.filter(|_| is_concurrent) else {
            tracing::debug!(
                execution = %execution,
                gateway = gateway.id(),
                "Single path parked at join"
            );
            return Ok(());
        };

        let siblings = self.tree.live(parent)?.children.clone();
        let joined: Vec<ExecutionId> = siblings
            .iter()
            .copied()
            .filter(|child| {
                self.tree.get(*child).is_some_and(|exec| {
                    exec.is_concurrent && !exec.active && exec.activity.as_deref() == Some(gateway.id())
                })
            })
            .collect();
        tracing::debug!(
            gateway = gateway.id(),
            joined = joined.len(),
            required,
            "Parallel gateway arrival"
        );
        if joined.len() < required {
            return Ok(());
        }

        if joined.len() == siblings.len() {
            for branch in &joined {
                self.destroy(*branch, tx)?;
            }
            let container = self.tree.live_mut(parent)?;
            container.active = true;
            container.activity = Some(gateway.id().to_string());
            self.leave(parent, tx)
        } else {
            for branch in joined.iter().filter(|branch| **branch != execution) {
                self.destroy(*branch, tx)?;
            }
            self.tree.live_mut(execution)?.active = true;
            self.leave(execution, tx)
        }
    }

    fn fork(
        &mut self,
        execution: ExecutionId,
        transitions: &[String],
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let (is_concurrent, parent, activity, has_children) = {
            let exec = self.tree.live(execution)?;
            (
                exec.is_concurrent,
                exec.parent,
                exec.activity.clone(),
                !exec.children.is_empty(),
            )
        };

        let mut branches = Vec::with_capacity(transitions.len());
        if is_concurrent {
            let parent = parent.ok_or_else(|| {
                EngineError::illegal_state(format!(
                    "concurrent execution {} has no parent",
                    execution
                ))
            })?;
            branches.push(execution);
            for _ in 1..transitions.len() {
                branches.push(self.tree.create_child(parent, false, true)?);
            }
        } else {
            if has_children {
                return Err(EngineError::illegal_state(format!(
                    "execution {} cannot fork while it has children",
                    execution
                )));
            }
            let (clone, sibling) = self.split(execution)?;
            branches.push(clone);
            branches.push(sibling);
            for _ in 2..transitions.len() {
                branches.push(self.tree.create_child(execution, false, true)?);
            }
        }

        for branch in &branches {
            self.tree.live_mut(*branch)?.activity = activity.clone();
        }
        tracing::debug!(
            execution = %execution,
            branches = branches.len(),
            "Forking concurrent branches"
        );
        for (branch, transition) in branches.into_iter().zip(transitions) {
            self.take_transition(branch, transition, tx)?;
        }
        Ok(())
    }

    /// Clone a childless active execution into a concurrent child and demote
    /// the original to an inactive container with a second, empty child.
    ///
    /// Operations already queued for the original move to the clone, and so
    /// do its event subscriptions and tasks.
    fn split(&mut self, execution: ExecutionId) -> Result<(ExecutionId, ExecutionId)> {
        let original = self.tree.live(execution)?;
        if !original.active {
            return Err(EngineError::illegal_state(format!(
                "execution {} is inactive and has no children",
                execution
            )));
        }
        let activity = original.activity.clone();
        let transition = original.transition.clone();
        let listener_index = original.listener_index;

        let clone = self.tree.create_child(execution, false, true)?;
        {
            let copy = self.tree.live_mut(clone)?;
            copy.activity = activity;
            copy.transition = transition;
            copy.listener_index = listener_index;
        }
        {
            let demoted = self.tree.live_mut(execution)?;
            demoted.active = false;
            demoted.activity = None;
            demoted.transition = None;
            demoted.listener_index = 0;
        }

        let mut moved = self.agenda.transfer(execution, clone);
        for agenda in &mut self.suspended {
            moved += agenda.transfer(execution, clone);
        }
        let subscriptions = self.subscriptions.reassign(execution, clone);
        let tasks = self.reassign_tasks(execution, clone);
        let sibling = self.tree.create_child(execution, false, true)?;
        tracing::debug!(
            execution = %execution,
            clone = %clone,
            sibling = %sibling,
            transferred = moved,
            subscriptions,
            tasks,
            "Split execution"
        );
        Ok((clone, sibling))
    }

    /// Create a concurrent execution next to or below `execution`.
    ///
    /// A childless active execution is split: it is cloned into a concurrent
    /// child that keeps its position, demoted to an inactive container, and a
    /// second empty concurrent child is returned.
    pub fn create_execution(&mut self, execution: ExecutionId) -> Result<ExecutionId> {
        let exec = self.tree.live(execution)?;
        if exec.is_concurrent {
            let parent = exec.parent.ok_or_else(|| {
                EngineError::illegal_state(format!(
                    "concurrent execution {} has no parent",
                    execution
                ))
            })?;
            return self.tree.create_child(parent, false, true);
        }
        if !exec.children.is_empty() {
            return self.tree.create_child(execution, false, true);
        }
        let (_, sibling) = self.split(execution)?;
        Ok(sibling)
    }

    /// Begin taking `transition_id` out of the current activity of `execution`
    pub(crate) fn take_transition(
        &mut self,
        execution: ExecutionId,
        transition_id: &str,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        let exec = self.tree.live(execution)?;
        if let Some(pending) = &exec.transition {
            return Err(EngineError::illegal_state(format!(
                "execution {} is already taking transition '{}'",
                execution, pending
            )));
        }
        if !exec.active {
            return Err(EngineError::illegal_state(format!(
                "execution {} is not active",
                execution
            )));
        }
        let definition = exec.definition().clone();
        let current = exec.activity.clone();
        let transition = definition.require_transition(transition_id)?;
        if current.as_deref() != Some(transition.source()) {
            return Err(EngineError::illegal_state(format!(
                "transition '{}' does not leave activity '{}' of execution {}",
                transition_id,
                current.as_deref().unwrap_or("<none>"),
                execution
            )));
        }

        self.subscriptions
            .delete_for_execution(execution, Some(transition.source()));
        self.delete_tasks_of(execution, tx)?;

        let exec = self.tree.live_mut(execution)?;
        exec.transition = Some(transition_id.to_string());
        exec.listener_index = 0;
        self.agenda.push(execution, Step::NotifyEnd);
        Ok(())
    }

    fn notify_end(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let activity = definition.require_activity(&self.current_activity(execution)?)?;
        let listeners = activity.execution_listeners(ExecutionEvent::End);
        if !self.notify_next(execution, listeners, ExecutionEvent::End, Step::NotifyEnd, tx)? {
            return Ok(());
        }
        self.agenda.push(execution, Step::DestroyScope);
        Ok(())
    }

    /// Leave one scope level if the destination lies outside the current scope.
    ///
    /// The scope execution is ended and its parent, positioned on the scope
    /// activity, takes over the transition and fires that activity's end
    /// listeners before the check repeats one level up.
    fn destroy_scope(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let transition_id = self.pending_transition(execution)?;
        let transition = definition.require_transition(&transition_id)?;
        let destination = definition.require_activity(transition.destination())?;

        if self.tree.scope_activity(execution)?.as_deref() == destination.parent() {
            self.agenda.push(execution, Step::NotifyTake);
            return Ok(());
        }

        let scope = self.tree.scope_execution(execution)?;
        let parent = self.tree.live(scope)?.parent.ok_or_else(|| {
            EngineError::illegal_state(format!(
                "transition '{}' leaves the process scope",
                transition_id
            ))
        })?;
        tracing::debug!(
            scope = %scope,
            parent = %parent,
            transition = %transition_id,
            "Leaving scope"
        );
        self.destroy(scope, tx)?;
        let resumed = self.tree.live_mut(parent)?;
        resumed.active = true;
        resumed.transition = Some(transition_id);
        resumed.listener_index = 0;
        self.agenda.push(parent, Step::NotifyEnd);
        Ok(())
    }

    fn notify_take(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let transition = definition.require_transition(&self.pending_transition(execution)?)?;
        if !self.notify_next(execution, transition.listeners(), ExecutionEvent::Take, Step::NotifyTake, tx)? {
            return Ok(());
        }
        self.agenda.push(execution, Step::CreateScope);
        Ok(())
    }

    fn create_scope(&mut self, execution: ExecutionId) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let transition = definition.require_transition(&self.pending_transition(execution)?)?;
        let destination = definition.require_activity(transition.destination())?;
        let destination_id = destination.id().to_string();

        if destination.is_scope() {
            let child = self.tree.create_child(execution, true, false)?;
            let parent = self.tree.live_mut(execution)?;
            let pending = parent.transition.take();
            parent.activity = Some(destination_id.clone());
            parent.active = false;
            let scope = self.tree.live_mut(child)?;
            scope.activity = Some(destination_id);
            scope.transition = pending;
            self.agenda.push(child, Step::NotifyStart);
        } else {
            self.tree.live_mut(execution)?.activity = Some(destination_id);
            self.agenda.push(execution, Step::NotifyStart);
        }
        Ok(())
    }

    fn activity_end(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let activity = definition.require_activity(&self.current_activity(execution)?)?;
        let listeners = activity.execution_listeners(ExecutionEvent::End);
        if !self.notify_next(execution, listeners, ExecutionEvent::End, Step::ActivityEnd, tx)? {
            return Ok(());
        }
        self.complete_path(execution, tx)
    }

    /// A path ended: concurrent branches are removed and join their container
    /// once it has no children left; scope executions complete their scope.
    fn complete_path(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let exec = self.tree.live(execution)?;
        if !exec.is_concurrent {
            self.agenda.push(execution, Step::ScopeEnd);
            return Ok(());
        }
        let parent = exec.parent.ok_or_else(|| {
            EngineError::illegal_state(format!(
                "concurrent execution {} has no parent",
                execution
            ))
        })?;
        self.destroy(execution, tx)?;

        let container = self.tree.live_mut(parent)?;
        if container.children.is_empty() {
            container.active = true;
            tracing::debug!(execution = %parent, "Last concurrent branch ended");
            self.agenda.push(parent, Step::ScopeEnd);
        }
        Ok(())
    }

    fn scope_end(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        match self.tree.live(execution)?.parent {
            None => {
                self.agenda.push(execution, Step::ProcessEnd);
                Ok(())
            }
            Some(parent) => {
                self.destroy(execution, tx)?;
                self.tree.live_mut(parent)?.active = true;
                self.leave(parent, tx)
            }
        }
    }

    fn process_end(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let definition = self.definition_of(execution)?;
        let listeners = definition.execution_listeners(ExecutionEvent::End);
        if !self.notify_next(execution, listeners, ExecutionEvent::End, Step::ProcessEnd, tx)? {
            return Ok(());
        }
        tracing::info!(
            process_instance = %execution,
            definition = definition.key(),
            "Process instance completed"
        );
        self.destroy(execution, tx)
    }

    /// End `execution` and its subtree, deleting their tasks and subscriptions
    pub(crate) fn destroy(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        for member in self.tree.subtree(execution) {
            self.delete_tasks_of(member, tx)?;
        }
        for ended in self.tree.end(execution) {
            self.subscriptions.delete_for_execution(ended, None);
        }
        Ok(())
    }

    /// Begin interpretation of a process instance that has not started yet
    pub fn start(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        let exec = self.tree.live(execution)?;
        if !exec.is_process_instance() || exec.activity.is_some() || !exec.children.is_empty() {
            return Err(EngineError::illegal_state(format!(
                "execution {} is not an unstarted process instance",
                execution
            )));
        }
        tracing::info!(
            process_instance = %execution,
            definition = exec.definition().key(),
            "Starting process instance"
        );
        self.interpret(tx, |engine, _| {
            engine.agenda.push(execution, Step::ProcessStart);
            Ok(())
        })
    }

    /// Take a transition out of the current activity of `execution`
    pub fn take(
        &mut self,
        execution: ExecutionId,
        transition_id: &str,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        self.interpret(tx, |engine, tx| {
            engine.take_transition(execution, transition_id, tx)
        })
    }

    /// Resume an execution waiting in a wait state or catch event
    pub fn trigger(
        &mut self,
        execution: ExecutionId,
        variables: HashMap<String, Value>,
        tx: &mut TransactionContext,
    ) -> Result<()> {
        self.interpret(tx, |engine, tx| {
            let exec = engine.tree.live(execution)?;
            if !exec.active || exec.transition.is_some() {
                return Err(EngineError::illegal_state(format!(
                    "execution {} is not waiting",
                    execution
                )));
            }
            let definition = exec.definition().clone();
            let activity_id = engine.current_activity(execution)?;
            let activity = definition.require_activity(&activity_id)?;
            if !matches!(
                activity.behavior(),
                Behavior::Wait | Behavior::CatchEvent { .. }
            ) {
                return Err(EngineError::illegal_state(format!(
                    "activity '{}' ({}) cannot be triggered",
                    activity_id,
                    activity.behavior().tag()
                )));
            }
            for (name, value) in variables {
                engine.tree.set_variable(execution, &name, value)?;
            }
            engine
                .subscriptions
                .delete_for_execution(execution, Some(&activity_id));
            engine.leave(execution, tx)
        })
    }

    /// Cancel `execution` and everything below it.
    ///
    /// Tasks in the subtree are deleted (firing their delete listeners) and
    /// subscriptions removed. The parent is left as it is.
    pub fn end_execution(&mut self, execution: ExecutionId, tx: &mut TransactionContext) -> Result<()> {
        self.tree.live(execution)?;
        tracing::info!(execution = %execution, "Cancelling execution");
        self.destroy(execution, tx)
    }

    /// Deliver a signal or message.
    ///
    /// Every matching subscription is removed before its execution resumes, so
    /// each waiting execution is resumed at most once. With a `target`, only
    /// that execution's subscription matches and a miss is `NotFound`.
    pub fn event_received(
        &mut self,
        kind: EventKind,
        name: &str,
        target: Option<ExecutionId>,
        payload: Option<HashMap<String, Value>>,
        tx: &mut TransactionContext,
    ) -> Result<Vec<ExecutionId>> {
        let mut query = self.subscriptions.query().kind(kind).event_name(name);
        if let Some(target) = target {
            query = query.execution_id(target);
        }
        let matches = query.list();

        if matches.is_empty() {
            if let Some(target) = target {
                return Err(EngineError::not_found(
                    "event subscription",
                    format!("{} '{}' of execution {}", kind, name, target),
                ));
            }
            tracing::debug!(kind = %kind, event = name, "No subscription matched");
            return Ok(Vec::new());
        }

        let mut resumed = Vec::with_capacity(matches.len());
        for subscription in matches {
            if !self.subscriptions.delete(subscription.id()) {
                tracing::debug!(subscription = %subscription.id(), "Subscription already consumed");
                continue;
            }
            let execution = subscription.execution_id();
            if !self.tree.is_live(execution) {
                tracing::warn!(
                    subscription = %subscription.id(),
                    execution = %execution,
                    "Subscription pointed at an ended execution"
                );
                continue;
            }
            tracing::debug!(
                kind = %kind,
                event = name,
                execution = %execution,
                activity = subscription.activity_id(),
                "Delivering event"
            );
            let payload = payload.clone();
            self.interpret(tx, |engine, tx| {
                for (variable, value) in payload.into_iter().flatten() {
                    engine.tree.set_variable(execution, &variable, value)?;
                }
                engine.leave(execution, tx)
            })?;
            resumed.push(execution);
        }
        Ok(resumed)
    }
}
