//! Shared helpers for integration tests

#![allow(dead_code)]

use braid::runtime::{Delegate, EngineConfig, ListenerDescriptor, ProcessEngine};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber honouring `RUST_LOG`; repeated calls are harmless
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn engine() -> ProcessEngine {
    init_tracing();
    ProcessEngine::new(EngineConfig::default()).unwrap()
}

/// Shared log of listener invocations
#[derive(Clone, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Execution listener that records `label:event@activity`
    pub fn execution_listener(&self, label: &str) -> ListenerDescriptor {
        let recorder = self.clone();
        let label = label.to_string();
        ListenerDescriptor::instance(Delegate::execution_fn(move |execution| {
            recorder.push(format!(
                "{}:{}@{}",
                label,
                execution.event_name(),
                execution.current_activity_id().unwrap_or_default()
            ));
            Ok(())
        }))
    }

    /// Task listener that records `label:event`
    pub fn task_listener(&self, label: &str) -> ListenerDescriptor {
        let recorder = self.clone();
        let label = label.to_string();
        ListenerDescriptor::instance(Delegate::task_fn(move |task| {
            recorder.push(format!("{}:{}", label, task.event()));
            Ok(())
        }))
    }

    /// Transaction-dependent listener that records `label:stage`
    pub fn transaction_listener(&self, label: &str) -> Delegate {
        let recorder = self.clone();
        let label = label.to_string();
        Delegate::transaction_fn(move |scope| {
            recorder.push(format!("{}:{}", label, scope.stage));
            Ok(())
        })
    }
}
