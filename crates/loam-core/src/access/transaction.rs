//! Explicit transaction handles.
//!
//! The transaction is passed to every commit and query operation as an
//! explicit parameter rather than bound to the calling thread, so the unit
//! of work has no hidden global state and composes with timeouts and
//! cancellation at the call site.

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Created, not yet begun.
    NoTransaction,
    /// Begun; connections may be enlisted.
    Active,
    /// Commit in progress.
    Committing,
    /// Committed; terminal.
    Committed,
    /// Rollback in progress.
    RollingBack,
    /// Rolled back; terminal.
    RolledBack,
}

/// A physical connection enlisted in a transaction.
///
/// SQL rendering and driver specifics live outside this crate; the core
/// only needs commit/rollback/close.
pub trait TransactionConnection: Send {
    /// Connection name for diagnostics.
    fn name(&self) -> &str;

    /// Commit work performed on this connection.
    fn commit(&mut self) -> Result<()>;

    /// Roll back work performed on this connection.
    fn rollback(&mut self) -> Result<()>;

    /// Release the connection.
    fn close(&mut self) -> Result<()>;
}

/// Veto and notification hooks around transaction phases.
///
/// `will_*` hooks returning false short-circuit the phase into a no-op;
/// `did_*` hooks fire after a successful phase.
pub trait TransactionDelegate: Send {
    /// About to enlist a connection. Return false to reject it.
    fn will_add_connection(&mut self, _name: &str) -> bool {
        true
    }

    /// About to commit. Return false to skip the physical commit.
    fn will_commit(&mut self) -> bool {
        true
    }

    /// About to roll back. Return false to skip the physical rollback.
    fn will_rollback(&mut self) -> bool {
        true
    }

    /// Commit finished.
    fn did_commit(&mut self) {}

    /// Rollback finished.
    fn did_rollback(&mut self) {}
}

/// A unit of work coordinating one or more physical connections.
///
/// State machine: NoTransaction -> Active -> {Committing -> Committed,
/// RollingBack -> RolledBack}. `begin` is only legal from NoTransaction;
/// adding a connection implicitly begins the transaction. On commit or
/// rollback every enlisted connection is closed unconditionally,
/// best-effort; that close is the only cleanup guarantee given.
///
/// An externally managed variant (see [`Transaction::external`]) follows
/// the same state machine but never issues connection-level commit or
/// rollback, assuming an outer resource coordinator does.
pub struct Transaction {
    status: TxStatus,
    connections: Vec<Box<dyn TransactionConnection>>,
    delegate: Option<Box<dyn TransactionDelegate>>,
    external: bool,
    rollback_only: bool,
}

impl Transaction {
    /// Create an internally managed transaction.
    pub fn internal() -> Self {
        Self {
            status: TxStatus::NoTransaction,
            connections: Vec::new(),
            delegate: None,
            external: false,
            rollback_only: false,
        }
    }

    /// Create an externally managed ("container") transaction.
    pub fn external() -> Self {
        Self {
            external: true,
            ..Self::internal()
        }
    }

    /// Install a delegate.
    pub fn set_delegate(&mut self, delegate: Box<dyn TransactionDelegate>) {
        self.delegate = Some(delegate);
    }

    /// Current status.
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Whether the transaction can only be rolled back.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Mark the transaction rollback-only. Any subsequent commit fails.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// Begin the transaction. Only legal from NoTransaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.status != TxStatus::NoTransaction {
            return Err(Error::Transaction(format!(
                "cannot begin transaction in status {:?}",
                self.status
            )));
        }
        self.status = TxStatus::Active;
        Ok(())
    }

    /// Enlist a connection, beginning the transaction if necessary.
    ///
    /// The delegate may veto, in which case the connection is closed and an
    /// error returned.
    pub fn add_connection(&mut self, mut connection: Box<dyn TransactionConnection>) -> Result<()> {
        if self.status == TxStatus::NoTransaction {
            self.begin()?;
        }
        if self.status != TxStatus::Active {
            return Err(Error::Transaction(format!(
                "cannot add connection in status {:?}",
                self.status
            )));
        }
        if let Some(delegate) = self.delegate.as_mut() {
            if !delegate.will_add_connection(connection.name()) {
                let _ = connection.close();
                return Err(Error::Transaction(format!(
                    "delegate rejected connection '{}'",
                    connection.name()
                )));
            }
        }
        self.connections.push(connection);
        Ok(())
    }

    /// Number of enlisted connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Commit the transaction.
    ///
    /// Illegal unless Active. A rollback-only transaction refuses to commit.
    /// A delegate veto turns the commit into a no-op that still closes the
    /// connections.
    pub fn commit(&mut self) -> Result<()> {
        if self.status != TxStatus::Active {
            return Err(Error::Transaction(format!(
                "cannot commit transaction in status {:?}",
                self.status
            )));
        }
        if self.rollback_only {
            return Err(Error::Transaction(
                "transaction is rollback-only".to_string(),
            ));
        }
        let vetoed = self
            .delegate
            .as_mut()
            .map(|d| !d.will_commit())
            .unwrap_or(false);
        self.status = TxStatus::Committing;
        let mut failure: Option<Error> = None;
        if !vetoed && !self.external {
            for connection in &mut self.connections {
                if let Err(err) = connection.commit() {
                    failure = Some(err);
                    break;
                }
            }
        }
        self.close_connections();
        match failure {
            Some(err) => {
                self.status = TxStatus::RolledBack;
                Err(err)
            }
            None => {
                self.status = TxStatus::Committed;
                debug!("transaction committed");
                if let Some(delegate) = self.delegate.as_mut() {
                    delegate.did_commit();
                }
                Ok(())
            }
        }
    }

    /// Roll back the transaction. Illegal unless Active.
    pub fn rollback(&mut self) -> Result<()> {
        if self.status != TxStatus::Active {
            return Err(Error::Transaction(format!(
                "cannot rollback transaction in status {:?}",
                self.status
            )));
        }
        let vetoed = self
            .delegate
            .as_mut()
            .map(|d| !d.will_rollback())
            .unwrap_or(false);
        self.status = TxStatus::RollingBack;
        let mut failure: Option<Error> = None;
        if !vetoed && !self.external {
            for connection in &mut self.connections {
                if let Err(err) = connection.rollback() {
                    // Keep rolling back the rest.
                    warn!(connection = connection.name(), error = %err, "rollback failed");
                    failure.get_or_insert(err);
                }
            }
        }
        self.close_connections();
        self.status = TxStatus::RolledBack;
        match failure {
            Some(err) => Err(err),
            None => {
                if let Some(delegate) = self.delegate.as_mut() {
                    delegate.did_rollback();
                }
                Ok(())
            }
        }
    }

    fn close_connections(&mut self) {
        for connection in &mut self.connections {
            if let Err(err) = connection.close() {
                warn!(connection = connection.name(), error = %err, "close failed");
            }
        }
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct ConnLog {
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        closes: AtomicUsize,
    }

    struct TestConnection {
        log: Arc<ConnLog>,
        fail_commit: bool,
    }

    impl TransactionConnection for TestConnection {
        fn name(&self) -> &str {
            "test"
        }
        fn commit(&mut self) -> Result<()> {
            self.log.commits.fetch_add(1, Ordering::SeqCst);
            if self.fail_commit {
                Err(Error::Connection("boom".into()))
            } else {
                Ok(())
            }
        }
        fn rollback(&mut self) -> Result<()> {
            self.log.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_begin_only_from_no_transaction() {
        let mut tx = Transaction::internal();
        tx.begin().unwrap();
        assert_eq!(tx.status(), TxStatus::Active);
        assert!(tx.begin().is_err());
    }

    #[test]
    fn test_add_connection_implicitly_begins() {
        let log = Arc::new(ConnLog::default());
        let mut tx = Transaction::internal();
        tx.add_connection(Box::new(TestConnection {
            log: Arc::clone(&log),
            fail_commit: false,
        }))
        .unwrap();
        assert_eq!(tx.status(), TxStatus::Active);

        tx.commit().unwrap();
        assert_eq!(tx.status(), TxStatus::Committed);
        assert_eq!(log.commits.load(Ordering::SeqCst), 1);
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rollback_only_refuses_commit() {
        let mut tx = Transaction::internal();
        tx.begin().unwrap();
        tx.set_rollback_only();
        assert!(tx.commit().is_err());
        tx.rollback().unwrap();
        assert_eq!(tx.status(), TxStatus::RolledBack);
    }

    #[test]
    fn test_external_transaction_skips_connection_commit() {
        let log = Arc::new(ConnLog::default());
        let mut tx = Transaction::external();
        tx.add_connection(Box::new(TestConnection {
            log: Arc::clone(&log),
            fail_commit: false,
        }))
        .unwrap();
        tx.commit().unwrap();
        // No connection-level commit, but connections are still closed.
        assert_eq!(log.commits.load(Ordering::SeqCst), 0);
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_commit_failure_closes_connections() {
        let log = Arc::new(ConnLog::default());
        let mut tx = Transaction::internal();
        tx.add_connection(Box::new(TestConnection {
            log: Arc::clone(&log),
            fail_commit: true,
        }))
        .unwrap();
        assert!(tx.commit().is_err());
        assert_eq!(tx.status(), TxStatus::RolledBack);
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delegate_veto_makes_commit_a_noop() {
        struct Veto;
        impl TransactionDelegate for Veto {
            fn will_commit(&mut self) -> bool {
                false
            }
        }
        let log = Arc::new(ConnLog::default());
        let mut tx = Transaction::internal();
        tx.set_delegate(Box::new(Veto));
        tx.add_connection(Box::new(TestConnection {
            log: Arc::clone(&log),
            fail_commit: false,
        }))
        .unwrap();
        tx.commit().unwrap();
        assert_eq!(log.commits.load(Ordering::SeqCst), 0);
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);
    }
}
