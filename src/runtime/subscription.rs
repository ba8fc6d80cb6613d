//! Event subscription registry
//!
//! Waiting catch events register a subscription keyed by event kind and name.
//! Delivery finds subscriptions through [`SubscriptionQuery`], deletes them and
//! resumes the owning executions.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::error::{EngineError, Result};
use super::execution::{Execution, ExecutionId};

/// Kind of event a subscription correlates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Broadcast signal
    Signal,
    /// Point-to-point message
    Message,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Signal => f.write_str("signal"),
            EventKind::Message => f.write_str("message"),
        }
    }
}

/// Subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Generate a new random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A waiting execution's interest in an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    id: SubscriptionId,
    kind: EventKind,
    event_name: String,
    execution_id: ExecutionId,
    activity_id: String,
    process_instance_id: ExecutionId,
    created: DateTime<Utc>,
}

impl EventSubscription {
    /// Subscription id
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Signal or message
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Correlation name
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Waiting execution
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Catching activity
    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    /// Process instance of the waiting execution
    pub fn process_instance_id(&self) -> ExecutionId {
        self.process_instance_id
    }

    /// Creation time
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
}

/// Thread-safe store of event subscriptions
#[derive(Debug, Default)]
pub struct EventSubscriptionRegistry {
    subscriptions: RwLock<Vec<EventSubscription>>,
}

impl EventSubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest of `execution` in an event while it waits in `activity_id`
    pub fn create_subscription(
        &self,
        kind: EventKind,
        event_name: &str,
        execution: &Execution,
        activity_id: &str,
    ) -> EventSubscription {
        let subscription = EventSubscription {
            id: SubscriptionId::new(),
            kind,
            event_name: event_name.to_string(),
            execution_id: execution.id(),
            activity_id: activity_id.to_string(),
            process_instance_id: execution.process_instance_id(),
            created: Utc::now(),
        };
        tracing::debug!(
            subscription = %subscription.id,
            kind = %kind,
            event = event_name,
            execution = %execution.id(),
            "Created event subscription"
        );
        self.subscriptions.write().push(subscription.clone());
        subscription
    }

    /// Start a filtered query
    pub fn query(&self) -> SubscriptionQuery<'_> {
        SubscriptionQuery {
            registry: self,
            id: None,
            kind: None,
            event_name: None,
            execution_id: None,
            activity_id: None,
            process_instance_id: None,
        }
    }

    /// Delete a subscription; returns `false` if it was already gone
    pub fn delete(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        before != subscriptions.len()
    }

    /// Delete every subscription of `execution`, optionally only those of one activity
    pub fn delete_for_execution(&self, execution: ExecutionId, activity_id: Option<&str>) -> usize {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| {
            subscription.execution_id != execution
                || activity_id.is_some_and(|activity| activity != subscription.activity_id)
        });
        before - subscriptions.len()
    }

    /// Hand every subscription of `from` over to `to`; returns how many moved
    pub fn reassign(&self, from: ExecutionId, to: ExecutionId) -> usize {
        let mut moved = 0;
        for subscription in self
            .subscriptions
            .write()
            .iter_mut()
            .filter(|subscription| subscription.execution_id == from)
        {
            subscription.execution_id = to;
            moved += 1;
        }
        moved
    }

    /// Number of stored subscriptions
    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Whether no subscription is stored
    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}

/// Builder-style filter over the registry; filters combine with AND
pub struct SubscriptionQuery<'a> {
    registry: &'a EventSubscriptionRegistry,
    id: Option<SubscriptionId>,
    kind: Option<EventKind>,
    event_name: Option<String>,
    execution_id: Option<ExecutionId>,
    activity_id: Option<String>,
    process_instance_id: Option<ExecutionId>,
}

impl<'a> SubscriptionQuery<'a> {
    /// Filter by subscription id
    pub fn id(mut self, id: SubscriptionId) -> Self {
        self.id = Some(id);
        self
    }

    /// Filter by event kind
    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Filter by event name
    pub fn event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = Some(name.into());
        self
    }

    /// Filter by waiting execution
    pub fn execution_id(mut self, execution: ExecutionId) -> Self {
        self.execution_id = Some(execution);
        self
    }

    /// Filter by catching activity
    pub fn activity_id(mut self, activity: impl Into<String>) -> Self {
        self.activity_id = Some(activity.into());
        self
    }

    /// Filter by process instance
    pub fn process_instance_id(mut self, instance: ExecutionId) -> Self {
        self.process_instance_id = Some(instance);
        self
    }

    fn matches(&self, subscription: &EventSubscription) -> bool {
        self.id.is_none_or(|id| subscription.id == id)
            && self.kind.is_none_or(|kind| subscription.kind == kind)
            && self
                .event_name
                .as_deref()
                .is_none_or(|name| subscription.event_name == name)
            && self
                .execution_id
                .is_none_or(|execution| subscription.execution_id == execution)
            && self
                .activity_id
                .as_deref()
                .is_none_or(|activity| subscription.activity_id == activity)
            && self
                .process_instance_id
                .is_none_or(|instance| subscription.process_instance_id == instance)
    }

    /// Matching subscriptions in creation order
    pub fn list(&self) -> Vec<EventSubscription> {
        self.registry
            .subscriptions
            .read()
            .iter()
            .filter(|subscription| self.matches(subscription))
            .cloned()
            .collect()
    }

    /// Number of matching subscriptions
    pub fn count(&self) -> usize {
        self.registry
            .subscriptions
            .read()
            .iter()
            .filter(|subscription| self.matches(subscription))
            .count()
    }

    /// The single match, if any; more than one match is an error
    pub fn single_result(&self) -> Result<Option<EventSubscription>> {
        let mut matches = self.list();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            count => Err(EngineError::NonUniqueResult {
                entity: "event subscription",
                count,
            }),
        }
    }
}
