// Prepared-statement cache and statement execution

use crate::runner::StatementRunner;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sqlgate_core::{normalize_rows, Error, JsonRow, PreparedStatement, Result, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::error::Elapsed;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CachedStatement {
    pub name: String,
    pub sql: String,
    pub parameter_count: usize,
    pub prepared_at: DateTime<Utc>,
}

/// Named statements prepared by this process.
///
/// Each name owns a once-cell: the first caller prepares, concurrent callers
/// wait for that result, later callers reuse it.
#[derive(Default)]
pub struct StatementCache {
    entries: DashMap<String, Arc<OnceCell<CachedStatement>>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_prepare<R>(
        &self,
        name: &str,
        sql: &str,
        runner: &mut R,
        timeout: Duration,
    ) -> Result<CachedStatement>
    where
        R: StatementRunner + ?Sized,
    {
        let cell = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_try_init(|| async move {
                let outcome = tokio::time::timeout(timeout, runner.prepare(sql)).await;
                let parameter_count = match outcome {
                    Ok(Ok(count)) => count,
                    Ok(Err(e)) => {
                        error!("Failed to prepare statement '{}': {:#}", name, e);
                        return Err(Error::ExecutionFailed(format!("{:#}", e)));
                    }
                    Err(_) => {
                        runner.invalidate();
                        return Err(timed_out(timeout));
                    }
                };
                info!("Prepared statement '{}' ({} parameters)", name, parameter_count);
                Ok(CachedStatement {
                    name: name.to_string(),
                    sql: sql.to_string(),
                    parameter_count,
                    prepared_at: Utc::now(),
                })
            })
            .await;

        match result {
            Ok(entry) if entry.sql == sql => Ok(entry.clone()),
            Ok(_) => Err(Error::StatementConflict(name.to_string())),
            Err(e) => {
                // Leave the name free for a retry
                self.entries
                    .remove_if(name, |_, c| Arc::ptr_eq(c, &cell) && !c.initialized());
                Err(e)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<CachedStatement> {
        self.entries.get(name).and_then(|cell| cell.get().cloned())
    }

    /// Prepared statements, sorted by name.
    pub fn list(&self) -> Vec<CachedStatement> {
        let mut statements: Vec<CachedStatement> = self
            .entries
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        statements.sort_by(|a, b| a.name.cmp(&b.name));
        statements
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Evict everything, returning how many entries were dropped.
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WriteOutcome {
    pub affected_rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<JsonRow>>,
}

fn timed_out(timeout: Duration) -> Error {
    Error::ExecutionFailed(format!(
        "statement timed out after {}s",
        timeout.as_secs_f64()
    ))
}

/// Executes statements with a bounded command time, normalizing every row.
pub struct StatementExecutor {
    cache: StatementCache,
    command_timeout: Duration,
}

impl StatementExecutor {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            cache: StatementCache::new(),
            command_timeout,
        }
    }

    pub fn cache(&self) -> &StatementCache {
        &self.cache
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    // Named statements go through the cache; unnamed ones run directly.
    async fn prepare_named<R>(&self, stmt: &PreparedStatement, runner: &mut R) -> Result<()>
    where
        R: StatementRunner + ?Sized,
    {
        let Some(name) = stmt.name() else {
            return Ok(());
        };
        let entry = self
            .cache
            .get_or_prepare(name, stmt.sql(), runner, self.command_timeout)
            .await?;
        if entry.parameter_count != stmt.parameters().len() {
            return Err(Error::ParameterMismatch {
                expected: entry.parameter_count,
                provided: stmt.parameters().len(),
            });
        }
        Ok(())
    }

    fn finish<R, T>(
        &self,
        stmt: &PreparedStatement,
        runner: &mut R,
        outcome: std::result::Result<anyhow::Result<T>, Elapsed>,
    ) -> Result<T>
    where
        R: StatementRunner + ?Sized,
    {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(
                    "Statement execution failed (name={:?}, parameters={}): {:#}",
                    stmt.name(),
                    stmt.parameters().len(),
                    e
                );
                Err(Error::ExecutionFailed(format!("{:#}", e)))
            }
            Err(_) => {
                runner.invalidate();
                error!(
                    "Statement timed out after {:?} (name={:?}), discarding connection",
                    self.command_timeout,
                    stmt.name()
                );
                Err(timed_out(self.command_timeout))
            }
        }
    }

    async fn fetch<R>(&self, stmt: &PreparedStatement, runner: &mut R) -> Result<Vec<Row>>
    where
        R: StatementRunner + ?Sized,
    {
        self.prepare_named(stmt, runner).await?;
        debug!("Fetching rows (parameters={})", stmt.parameters().len());
        let outcome = tokio::time::timeout(
            self.command_timeout,
            runner.fetch(stmt.sql(), stmt.parameters()),
        )
        .await;
        self.finish(stmt, runner, outcome)
    }

    pub async fn execute_rows<R>(&self, stmt: &PreparedStatement, runner: &mut R) -> Result<Vec<JsonRow>>
    where
        R: StatementRunner + ?Sized,
    {
        let rows = self.fetch(stmt, runner).await?;
        Ok(normalize_rows(&rows))
    }

    pub async fn execute_row<R>(&self, stmt: &PreparedStatement, runner: &mut R) -> Result<Option<JsonRow>>
    where
        R: StatementRunner + ?Sized,
    {
        Ok(self.execute_rows(stmt, runner).await?.into_iter().next())
    }

    /// First column of the first row, or JSON null when there is no row.
    pub async fn execute_scalar<R>(&self, stmt: &PreparedStatement, runner: &mut R) -> Result<Value>
    where
        R: StatementRunner + ?Sized,
    {
        let row = self.execute_row(stmt, runner).await?;
        Ok(row
            .and_then(|r| r.into_iter().next().map(|(_, v)| v))
            .unwrap_or(Value::Null))
    }

    pub async fn execute_write<R>(&self, stmt: &PreparedStatement, runner: &mut R) -> Result<WriteOutcome>
    where
        R: StatementRunner + ?Sized,
    {
        if stmt.returns_rows() {
            let rows = self.execute_rows(stmt, runner).await?;
            return Ok(WriteOutcome {
                affected_rows: rows.len() as u64,
                rows: Some(rows),
            });
        }

        self.prepare_named(stmt, runner).await?;
        let outcome = tokio::time::timeout(
            self.command_timeout,
            runner.execute(stmt.sql(), stmt.parameters()),
        )
        .await;
        let affected_rows = self.finish(stmt, runner, outcome)?;
        Ok(WriteOutcome {
            affected_rows,
            rows: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sqlgate_core::SqlValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedRunner {
        prepares: Arc<AtomicUsize>,
        fail_prepare: bool,
        delay: Option<Duration>,
        rows: Vec<Row>,
        invalidated: bool,
    }

    #[async_trait]
    impl StatementRunner for ScriptedRunner {
        async fn prepare(&mut self, sql: &str) -> anyhow::Result<usize> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            if self.fail_prepare {
                anyhow::bail!("syntax error at or near \"SELEC\"");
            }
            Ok(sqlgate_core::placeholder_count(sql))
        }

        async fn fetch(&mut self, _sql: &str, _params: &[SqlValue]) -> anyhow::Result<Vec<Row>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.rows.clone())
        }

        async fn execute(&mut self, _sql: &str, _params: &[SqlValue]) -> anyhow::Result<u64> {
            Ok(3)
        }

        fn invalidate(&mut self) {
            self.invalidated = true;
        }
    }

    fn named(sql: &str, params: Vec<SqlValue>, name: &str) -> PreparedStatement {
        PreparedStatement::new(sql, params)
            .unwrap()
            .with_name(Some(name.to_string()))
    }

    #[tokio::test]
    async fn test_named_statement_prepared_once() {
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut runner = ScriptedRunner::default();
        let stmt = named("SELECT * FROM t WHERE id = $1", vec![SqlValue::Int(1)], "by_id");

        executor.execute_rows(&stmt, &mut runner).await.unwrap();
        executor.execute_rows(&stmt, &mut runner).await.unwrap();

        assert_eq!(runner.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(executor.cache().len(), 1);
        assert_eq!(executor.cache().get("by_id").unwrap().parameter_count, 1);
    }

    #[tokio::test]
    async fn test_conflicting_sql_under_same_name() {
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut runner = ScriptedRunner::default();
        executor
            .execute_rows(&named("SELECT 1", vec![], "q"), &mut runner)
            .await
            .unwrap();

        let err = executor
            .execute_rows(&named("SELECT 2", vec![], "q"), &mut runner)
            .await
            .unwrap_err();
        assert_eq!(err, Error::StatementConflict("q".to_string()));

        assert!(executor.cache().remove("q"));
        executor
            .execute_rows(&named("SELECT 2", vec![], "q"), &mut runner)
            .await
            .unwrap();
        assert_eq!(runner.prepares.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_prepare_is_not_cached() {
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut runner = ScriptedRunner {
            fail_prepare: true,
            ..Default::default()
        };
        let err = executor
            .execute_rows(&named("SELEC 1", vec![], "broken"), &mut runner)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExecutionFailed(msg) if msg.contains("syntax error")));
        assert!(executor.cache().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_invalidates_connection() {
        let executor = StatementExecutor::new(Duration::from_millis(20));
        let mut runner = ScriptedRunner {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let stmt = PreparedStatement::new("SELECT pg_sleep(5)", vec![]).unwrap();
        let err = executor.execute_rows(&stmt, &mut runner).await.unwrap_err();
        assert_eq!(err, Error::ExecutionFailed("statement timed out after 0.02s".to_string()));
        assert!(runner.invalidated);
    }

    #[tokio::test]
    async fn test_scalar_and_write_outcomes() {
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut row = Row::new();
        row.insert("exists".to_string(), SqlValue::Bool(true));
        let mut runner = ScriptedRunner {
            rows: vec![row],
            ..Default::default()
        };

        let stmt = PreparedStatement::new("SELECT EXISTS(SELECT 1)", vec![]).unwrap();
        assert_eq!(executor.execute_scalar(&stmt, &mut runner).await.unwrap(), Value::Bool(true));

        let update = PreparedStatement::new("UPDATE t SET a = 1", vec![]).unwrap();
        let outcome = executor.execute_write(&update, &mut runner).await.unwrap();
        assert_eq!(outcome, WriteOutcome { affected_rows: 3, rows: None });

        let insert = PreparedStatement::new("INSERT INTO t DEFAULT VALUES RETURNING *", vec![]).unwrap();
        let outcome = executor.execute_write(&insert, &mut runner).await.unwrap();
        assert_eq!(outcome.affected_rows, 1);
        assert_eq!(outcome.rows.unwrap()[0]["exists"], Value::Bool(true));

        runner.rows.clear();
        assert_eq!(executor.execute_scalar(&stmt, &mut runner).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_returning_in_literal_counts_driver_rows() {
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut runner = ScriptedRunner::default();
        let insert = PreparedStatement::new("INSERT INTO t (note) VALUES ('returning soon')", vec![]).unwrap();

        let outcome = executor.execute_write(&insert, &mut runner).await.unwrap();
        assert_eq!(outcome, WriteOutcome { affected_rows: 3, rows: None });
    }

    #[tokio::test]
    async fn test_clear_reports_count() {
        let executor = StatementExecutor::new(Duration::from_secs(5));
        let mut runner = ScriptedRunner::default();
        for name in ["b", "a"] {
            executor
                .execute_rows(&named("SELECT 1", vec![], name), &mut runner)
                .await
                .unwrap();
        }
        let names: Vec<String> = executor.cache().list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(executor.cache().clear(), 2);
        assert!(executor.cache().list().is_empty());
    }
}
