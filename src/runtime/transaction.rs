//! Transaction context and deferred listener stages
//!
//! Engine calls run inside a caller-owned [`TransactionContext`]. Work queued
//! for a stage runs when the context reaches it: before-commit work may still
//! abort the transaction, committed and rolled-back work only reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::error::{EngineError, Result};

/// Stage a deferred listener is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionState {
    /// Runs during commit, before the commit is final; failure rolls back
    BeforeCommit,
    /// Runs after a successful commit
    Committed,
    /// Runs after a rollback
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::BeforeCommit => "before-commit",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a transaction context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStatus {
    /// Accepting work
    Active,
    /// Commit finished
    Committed,
    /// Rolled back, explicitly or by a failing before-commit listener
    RolledBack,
}

/// Deferred unit of work
pub type TransactionListener = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Failures of listeners that ran after the outcome was already decided
#[derive(Debug, Default)]
pub struct TransactionReport {
    /// Number of listeners that ran
    pub executed: usize,
    /// Errors of listeners that failed; the transaction outcome is unaffected
    pub failures: Vec<anyhow::Error>,
}

impl TransactionReport {
    /// Whether every listener succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Caller-owned transaction boundary
pub struct TransactionContext {
    id: Uuid,
    status: TransactionStatus,
    listeners: Vec<(TransactionState, TransactionListener)>,
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("pending", &self.listeners.len())
            .finish()
    }
}

impl TransactionContext {
    /// Open a new active transaction
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TransactionStatus::Active,
            listeners: Vec::new(),
        }
    }

    /// Transaction id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Number of listeners queued for `stage`
    pub fn pending(&self, stage: TransactionState) -> usize {
        self.listeners.iter().filter(|(s, _)| *s == stage).count()
    }

    /// Queue work for a stage; order of registration is preserved per stage
    pub fn add_transaction_listener(
        &mut self,
        stage: TransactionState,
        listener: TransactionListener,
    ) -> Result<()> {
        if self.status != TransactionStatus::Active {
            return Err(EngineError::illegal_state(format!(
                "transaction {} is no longer active",
                self.id
            )));
        }
        self.listeners.push((stage, listener));
        Ok(())
    }

    fn take_stage(&mut self, stage: TransactionState) -> Vec<TransactionListener> {
        let (matching, rest) = std::mem::take(&mut self.listeners)
            .into_iter()
            .partition::<Vec<_>, _>(|(s, _)| *s == stage);
        self.listeners = rest;
        matching.into_iter().map(|(_, listener)| listener).collect()
    }

    fn run_reporting(&mut self, stage: TransactionState) -> TransactionReport {
        let mut report = TransactionReport::default();
        for listener in self.take_stage(stage) {
            report.executed += 1;
            if let Err(err) = listener() {
                tracing::error!(
                    transaction = %self.id,
                    stage = %stage,
                    error = %format!("{:#}", err),
                    "Transaction listener failed"
                );
                report.failures.push(err);
            }
        }
        report
    }

    /// Commit: run before-commit work, then committed work.
    ///
    /// A failing before-commit listener aborts the commit; the context is
    /// rolled back and the failure is returned.
    pub fn commit(mut self) -> Result<TransactionReport> {
        if self.status != TransactionStatus::Active {
            return Err(EngineError::illegal_state(format!(
                "transaction {} is no longer active",
                self.id
            )));
        }

        let mut executed = 0;
        for listener in self.take_stage(TransactionState::BeforeCommit) {
            executed += 1;
            if let Err(source) = listener() {
                tracing::warn!(
                    transaction = %self.id,
                    error = %format!("{:#}", source),
                    "Before-commit listener failed; rolling back"
                );
                self.finish_rollback();
                return Err(EngineError::ListenerInvocation {
                    listener: "transaction listener".to_string(),
                    event: TransactionState::BeforeCommit.to_string(),
                    source,
                });
            }
        }

        self.status = TransactionStatus::Committed;
        let mut report = self.run_reporting(TransactionState::Committed);
        report.executed += executed;
        tracing::debug!(transaction = %self.id, executed = report.executed, "Transaction committed");
        Ok(report)
    }

    /// Roll back: discard pending work and run rolled-back listeners
    pub fn rollback(mut self) -> TransactionReport {
        self.finish_rollback()
    }

    fn finish_rollback(&mut self) -> TransactionReport {
        self.status = TransactionStatus::RolledBack;
        let report = self.run_reporting(TransactionState::RolledBack);
        self.listeners.clear();
        tracing::debug!(transaction = %self.id, executed = report.executed, "Transaction rolled back");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> TransactionListener) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = log.clone();
        let make = move |label: &str| -> TransactionListener {
            let log = handle.clone();
            let label = label.to_string();
            Box::new(move || {
                log.lock().push(label);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_commit_runs_stages_in_order() {
        let (log, make) = recorder();
        let mut tx = TransactionContext::new();
        tx.add_transaction_listener(TransactionState::Committed, make("c1")).unwrap();
        tx.add_transaction_listener(TransactionState::BeforeCommit, make("b1")).unwrap();
        tx.add_transaction_listener(TransactionState::RolledBack, make("r1")).unwrap();
        tx.add_transaction_listener(TransactionState::Committed, make("c2")).unwrap();

        let report = tx.commit().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.executed, 3);
        assert_eq!(*log.lock(), vec!["b1", "c1", "c2"]);
    }

    #[test]
    fn test_failing_before_commit_rolls_back() {
        let (log, make) = recorder();
        let mut tx = TransactionContext::new();
        tx.add_transaction_listener(
            TransactionState::BeforeCommit,
            Box::new(|| Err(anyhow::anyhow!("veto"))),
        )
        .unwrap();
        tx.add_transaction_listener(TransactionState::Committed, make("committed")).unwrap();
        tx.add_transaction_listener(TransactionState::RolledBack, make("rolled-back")).unwrap();

        let err = tx.commit().unwrap_err();
        assert!(err.is_listener_failure());
        assert_eq!(*log.lock(), vec!["rolled-back"]);
    }

    #[test]
    fn test_committed_failures_are_reported_not_raised() {
        let (log, make) = recorder();
        let mut tx = TransactionContext::new();
        tx.add_transaction_listener(
            TransactionState::Committed,
            Box::new(|| Err(anyhow::anyhow!("mail server down"))),
        )
        .unwrap();
        tx.add_transaction_listener(TransactionState::Committed, make("after")).unwrap();

        let report = tx.commit().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn test_rollback_runs_only_rolled_back() {
        let (log, make) = recorder();
        let mut tx = TransactionContext::new();
        tx.add_transaction_listener(TransactionState::Committed, make("c")).unwrap();
        tx.add_transaction_listener(TransactionState::RolledBack, make("r")).unwrap();

        let report = tx.rollback();
        assert_eq!(report.executed, 1);
        assert_eq!(*log.lock(), vec!["r"]);
    }
}
