//! Ordered application of SQL operations
//!
//! Consecutive transaction-safe statements are sent as one `BEGIN ... COMMIT`
//! batch. `CREATE DATABASE` and `DROP DATABASE` cannot run inside a
//! transaction block and are sent on their own.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::SqlOperation;

/// Errors raised while applying operations
#[derive(Error, Debug)]
pub enum ExecError {
    /// Statement `index` failed; the first `applied` operations are committed
    #[error("Statement {index} ({statement}) failed: {message}")]
    Statement {
        index: usize,
        statement: String,
        message: String,
        sqlstate: Option<String>,
        applied: usize,
    },

    #[error("SQL execution timed out after {timeout:?} ({applied} operations applied)")]
    Timeout { timeout: Duration, applied: usize },
}

impl ExecError {
    /// Number of operations committed before the failure
    pub fn applied(&self) -> usize {
        match self {
            ExecError::Statement { applied, .. } | ExecError::Timeout { applied, .. } => *applied,
        }
    }
}

/// Applies ordered operation lists to PostgreSQL
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Apply `operations` in order, returning the number applied
    async fn execute(&self, operations: &[SqlOperation]) -> Result<usize, ExecError>;
}

/// Split an ordered operation list into transaction batches
///
/// Each batch is a run of consecutive transactional operations, or a single
/// non-transactional one. Returned ranges index into `operations`.
pub fn batches(operations: &[SqlOperation]) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    for (idx, op) in operations.iter().enumerate() {
        if !op.is_transactional() {
            if start < idx {
                ranges.push(start..idx);
            }
            ranges.push(idx..idx + 1);
            start = idx + 1;
        }
    }
    if start < operations.len() {
        ranges.push(start..operations.len());
    }
    ranges
}

/// [`SqlExecutor`] over a live connection
pub struct PgExecutor<'a> {
    client: &'a tokio_postgres::Client,
    timeout: Duration,
}

impl<'a> PgExecutor<'a> {
    pub fn new(client: &'a tokio_postgres::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Run one batch; `offset` is the index of its first operation in the full list
    async fn run_batch(
        &self,
        batch: &[SqlOperation],
        offset: usize,
        applied: usize,
    ) -> Result<(), ExecError> {
        let transactional = batch.iter().all(SqlOperation::is_transactional);
        if transactional {
            self.send("BEGIN", offset, "BEGIN", applied).await?;
        }

        for (i, op) in batch.iter().enumerate() {
            debug!(statement = %op, "Applying SQL");
            let result = self
                .send(&op.to_sql(), offset + i, &op.redacted(), applied)
                .await;
            if let Err(e) = result {
                if transactional {
                    self.rollback().await;
                }
                return Err(e);
            }
        }

        if transactional {
            let last = offset + batch.len().saturating_sub(1);
            if let Err(e) = self.send("COMMIT", last, "COMMIT", applied).await {
                self.rollback().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn send(
        &self,
        sql: &str,
        index: usize,
        redacted: &str,
        applied: usize,
    ) -> Result<(), ExecError> {
        match tokio::time::timeout(self.timeout, self.client.batch_execute(sql)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ExecError::Statement {
                index,
                statement: redacted.to_string(),
                message: e
                    .as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| e.to_string()),
                sqlstate: e.code().map(|c| c.code().to_string()),
                applied,
            }),
            Err(_) => Err(ExecError::Timeout {
                timeout: self.timeout,
                applied,
            }),
        }
    }

    async fn rollback(&self) {
        if let Err(e) = self.client.batch_execute("ROLLBACK").await {
            warn!(error = %e, "Rollback failed");
        }
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor<'_> {
    async fn execute(&self, operations: &[SqlOperation]) -> Result<usize, ExecError> {
        let mut applied = 0;
        for range in batches(operations) {
            let offset = range.start;
            let batch = operations.get(range.clone()).unwrap_or_default();
            self.run_batch(batch, offset, applied).await?;
            applied = range.end;
        }
        Ok(applied)
    }
}
