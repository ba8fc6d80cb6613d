//! Delegate catalog
//!
//! Holds the named beans that `${...}` expressions resolve against and the
//! class factories that class-reference listeners instantiate. The catalog is
//! shared by an engine and its callers, so registration may happen at any time
//! before the listener fires.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::{EngineError, Result};
use super::listener::{
    CustomPropertiesResolver, Delegate, ExecutionListener, TaskListener,
    TransactionDependentListener,
};

/// Factory producing a fresh delegate for a class reference
pub type DelegateFactory = Arc<dyn Fn() -> Delegate + Send + Sync>;

/// Named beans and class factories
#[derive(Default)]
pub struct DelegateCatalog {
    beans: RwLock<HashMap<String, Delegate>>,
    classes: RwLock<HashMap<String, DelegateFactory>>,
}

impl DelegateCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a named bean
    pub fn register_bean(&self, name: impl Into<String>, delegate: Delegate) {
        self.beans.write().insert(name.into(), delegate);
    }

    /// Register a class factory
    pub fn register_class<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Delegate + Send + Sync + 'static,
    {
        self.classes.write().insert(name.into(), Arc::new(factory));
    }

    /// Register an execution listener type that implements `Default`
    pub fn register_execution_listener<T>(&self, name: impl Into<String>)
    where
        T: ExecutionListener + Default + 'static,
    {
        self.register_class(name, || Delegate::ExecutionListener(Arc::new(T::default())));
    }

    /// Register a task listener type that implements `Default`
    pub fn register_task_listener<T>(&self, name: impl Into<String>)
    where
        T: TaskListener + Default + 'static,
    {
        self.register_class(name, || Delegate::TaskListener(Arc::new(T::default())));
    }

    /// Register a transaction-dependent listener type that implements `Default`
    pub fn register_transaction_listener<T>(&self, name: impl Into<String>)
    where
        T: TransactionDependentListener + Default + 'static,
    {
        self.register_class(name, || {
            Delegate::TransactionDependent(Arc::new(T::default()))
        });
    }

    /// Register a custom-properties resolver type that implements `Default`
    pub fn register_properties_resolver<T>(&self, name: impl Into<String>)
    where
        T: CustomPropertiesResolver + Default + 'static,
    {
        self.register_class(name, || {
            Delegate::PropertiesResolver(Arc::new(T::default()))
        });
    }

    /// Look up a bean by name
    pub fn bean(&self, name: &str) -> Option<Delegate> {
        self.beans.read().get(name).cloned()
    }

    /// Whether a class is registered under `name`
    pub fn has_class(&self, name: &str) -> bool {
        self.classes.read().contains_key(name)
    }

    /// Instantiate a registered class
    pub fn instantiate(&self, name: &str) -> Result<Delegate> {
        let factory = self.classes.read().get(name).cloned().ok_or_else(|| {
            EngineError::DelegateResolution {
                implementation: format!("class:{}", name),
                detail: "class is not registered".to_string(),
            }
        })?;
        Ok(factory())
    }

    /// Registered bean names, sorted
    pub fn bean_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.beans.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::listener::DelegateExecution;
    use serde_json::json;

    #[derive(Default)]
    struct Noop;

    impl ExecutionListener for Noop {
        fn notify(&self, _execution: &mut DelegateExecution<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup_beans() {
        let catalog = DelegateCatalog::new();
        catalog.register_bean("limit", Delegate::Value(json!(100)));
        catalog.register_bean("audit", Delegate::execution_fn(|_| Ok(())));

        assert!(matches!(catalog.bean("limit"), Some(Delegate::Value(v)) if v == json!(100)));
        assert_eq!(catalog.bean_names(), vec!["audit".to_string(), "limit".to_string()]);
        assert!(catalog.bean("missing").is_none());
    }

    #[test]
    fn test_instantiate_class() {
        let catalog = DelegateCatalog::new();
        catalog.register_execution_listener::<Noop>("noop");

        assert!(catalog.has_class("noop"));
        assert!(matches!(
            catalog.instantiate("noop"),
            Ok(Delegate::ExecutionListener(_))
        ));
        assert!(matches!(
            catalog.instantiate("unknown"),
            Err(EngineError::DelegateResolution { .. })
        ));
    }
}
