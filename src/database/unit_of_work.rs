//! Unit of work with after-commit hooks
//!
//! Producers that enqueue inside their own transaction must not wake
//! consumers until the rows are durably visible. Hooks registered with
//! [`UnitOfWork::after_commit`] run only once `COMMIT` has returned
//! successfully; a rollback, or dropping the unit of work, discards them.

use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::future::Future;
use tracing::debug;

use crate::error::Result;

/// A deferred action run after commit
pub type AfterCommitHook = BoxFuture<'static, ()>;

/// A database transaction plus the actions to run once it commits
pub struct UnitOfWork {
    tx: Transaction<'static, Postgres>,
    after_commit: Vec<AfterCommitHook>,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("pending_hooks", &self.after_commit.len())
            .finish()
    }
}

impl UnitOfWork {
    /// Begin a new transaction on the pool
    pub async fn begin(pool: &PgPool) -> Result<Self> {
        let tx = pool.begin().await?;
        Ok(Self {
            tx,
            after_commit: Vec::new(),
        })
    }

    /// The connection the transaction runs on, for executing statements
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }

    /// Register an action to run after a successful commit
    pub fn after_commit<F>(&mut self, hook: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.after_commit.push(Box::pin(hook));
    }

    /// Number of hooks waiting for commit
    pub fn pending_hooks(&self) -> usize {
        self.after_commit.len()
    }

    /// Commit, then run the registered hooks in registration order
    pub async fn commit(self) -> Result<()> {
        let Self { tx, after_commit } = self;
        tx.commit().await?;

        if !after_commit.is_empty() {
            debug!(hooks = after_commit.len(), "Running after-commit hooks");
        }
        for hook in after_commit {
            hook.await;
        }
        Ok(())
    }

    /// Roll back and discard the registered hooks
    pub async fn rollback(self) -> Result<()> {
        let Self { tx, after_commit } = self;
        if !after_commit.is_empty() {
            debug!(
                hooks = after_commit.len(),
                "Discarding after-commit hooks on rollback"
            );
        }
        drop(after_commit);
        tx.rollback().await?;
        Ok(())
    }
}
