use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::store::{borrow_within, Connection, Dialect, Store};

/// Creates and removes the store schema.
pub trait Migrator: Send + Sync {
    /// Creates every schema object. Objects that already exist are skipped,
    /// so running it against a bootstrapped store is a no-op.
    fn up(&self) -> impl Future<Output = Result<()>> + Send;

    /// Drops the whole schema, including stored history.
    fn down(&self) -> impl Future<Output = Result<()>> + Send;

    /// Borrows a connection and runs a trivial statement.
    fn check(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Runs the statements of a [`Dialect`] against a [`Store`].
pub struct SchemaMigrator<S> {
    store: Arc<S>,
    dialect: Arc<dyn Dialect>,
    borrow_timeout: Duration,
}

impl<S: Store> SchemaMigrator<S> {
    pub fn new(store: Arc<S>, dialect: Arc<dyn Dialect>, borrow_timeout: Duration) -> Self {
        Self {
            store,
            dialect,
            borrow_timeout,
        }
    }

    async fn connect(&self) -> Result<S::Conn> {
        borrow_within(self.store.as_ref(), self.borrow_timeout)
            .await
            .with_context(|| format!("connecting to {} store", self.dialect.name()))
    }
}

fn preview(stmt: &str) -> String {
    stmt.chars().take(80).collect()
}

impl<S: Store> Migrator for SchemaMigrator<S> {
    async fn up(&self) -> Result<()> {
        let statements = self.dialect.bootstrap_schema();
        let mut conn = self.connect().await?;

        let mut created = 0usize;
        let mut existing = 0usize;

        for stmt in &statements {
            match conn.execute(stmt).await {
                Ok(()) => created += 1,
                Err(e) if e.is_already_exists() => {
                    tracing::debug!(error = %e, "schema object already exists");
                    existing += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("executing schema statement: {}...", preview(stmt))
                    });
                }
            }
        }

        tracing::info!(
            dialect = self.dialect.name(),
            created,
            existing,
            "schema bootstrap completed"
        );

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        let statements = self.dialect.drop_schema();
        let mut conn = self.connect().await?;

        for stmt in &statements {
            conn.execute(stmt)
                .await
                .with_context(|| format!("executing drop statement: {}...", preview(stmt)))?;
        }

        tracing::info!(dialect = self.dialect.name(), "schema dropped");

        Ok(())
    }

    async fn check(&self) -> Result<()> {
        let stmt = self.dialect.ping();
        let mut conn = self.connect().await?;
        conn.execute(&stmt)
            .await
            .with_context(|| format!("pinging {} store", self.dialect.name()))?;
        Ok(())
    }
}
