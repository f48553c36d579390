// Gateway service: owns the pool, the statement executor and the validator

use crate::catalog;
use crate::executor::{CachedStatement, StatementCache, StatementExecutor};
use crate::pool::{PoolManager, PoolStats, PooledConnection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlgate_core::builder::{
    build_count, build_delete, build_exists, build_insert, build_select, build_select_by_id,
    build_table_exists, build_update, validate_limit, validate_offset, DEFAULT_LIMIT,
};
use sqlgate_core::{
    placeholder_count, sanitize_schema, sanitize_table, AuditLogger, Error, GatewayConfig,
    JsonRow, OperationMode, OrderBy, ParameterSet, PreparedStatement, RecordId, Result,
    SanitizedIdentifier, SelectOptions, SqlValidator, SqlValue,
};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Caller SQL for the raw and prepared paths.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SqlRequest {
    pub sql: String,
    #[serde(default)]
    pub parameters: Option<ParameterSet>,
    #[serde(default)]
    pub operation_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl SqlRequest {
    pub fn mode(&self) -> Result<OperationMode> {
        match &self.operation_type {
            Some(raw) => OperationMode::from_str(raw),
            None => Ok(OperationMode::Read),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SqlResponse {
    pub success: bool,
    pub message: String,
    pub data: Option<Vec<JsonRow>>,
    pub row_count: Option<usize>,
    pub affected_rows: Option<u64>,
    pub sql: String,
    pub parameters: Option<ParameterSet>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub message: String,
    pub sql: String,
    pub placeholder_count: usize,
    pub parameter_count: usize,
    pub operation_type: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecordResponse {
    pub id: Value,
    pub data: JsonRow,
    pub created_at: Value,
    pub updated_at: Value,
}

impl From<JsonRow> for RecordResponse {
    fn from(data: JsonRow) -> Self {
        let field = |name: &str| data.get(name).cloned().unwrap_or(Value::Null);
        Self {
            id: field("id"),
            created_at: field("created_at"),
            updated_at: field("updated_at"),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordsResponse {
    pub records: Vec<RecordResponse>,
    pub count: usize,
    pub total_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub deleted_record: RecordResponse,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOperation {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertResponse {
    pub message: String,
    pub operation: UpsertOperation,
    pub record: RecordResponse,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListOptions {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub order_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub database: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub version: Value,
    pub database: Value,
    pub user: Value,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTest {
    pub status: String,
    pub message: String,
    pub details: ConnectionDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDetails {
    pub status: String,
    pub version: Value,
    pub database: Value,
    pub user: Value,
    pub host: String,
    pub port: u16,
    pub write_test: String,
}

/// The long-lived service object behind every handler.
pub struct Gateway {
    config: GatewayConfig,
    pool: PoolManager,
    executor: StatementExecutor,
    validator: SqlValidator,
}

fn audited<T>(checked: Result<T>) -> Result<T> {
    if let Err(Error::InvalidIdentifier(reason)) = &checked {
        AuditLogger::log_identifier_rejected(reason);
    }
    checked
}

fn schema_identifier(schema: &str) -> Result<SanitizedIdentifier> {
    audited(sanitize_schema(schema))
}

fn identifiers(schema: &str, table: &str) -> Result<(SanitizedIdentifier, SanitizedIdentifier)> {
    audited(sanitize_schema(schema).and_then(|s| Ok((s, sanitize_table(table)?))))
}

fn internal(sql: &str) -> Result<PreparedStatement> {
    PreparedStatement::new(sql, Vec::new())
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let pool = PoolManager::new(config.database.clone(), config.pool.clone());
        let executor = StatementExecutor::new(config.pool.command_timeout());
        Self {
            config,
            pool,
            executor,
            validator: SqlValidator::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Create the connection pool eagerly.
    pub async fn init(&self) -> Result<()> {
        self.pool.init().await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let evicted = self.executor.cache().clear();
        debug!("Evicted {} cached statements", evicted);
        self.pool.shutdown().await;
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn statements(&self) -> &StatementCache {
        self.executor.cache()
    }

    async fn connection(&self) -> Result<PooledConnection> {
        Ok(self.pool.acquire().await?)
    }

    // Admin

    pub async fn health(&self) -> Result<HealthReport> {
        let mut conn = self.connection().await?;
        self.executor.execute_scalar(&internal(catalog::PING)?, &mut conn).await?;
        Ok(HealthReport {
            status: "healthy".to_string(),
            database: "connected".to_string(),
            host: self.config.database.host.clone(),
            port: self.config.database.port,
        })
    }

    pub async fn database_info(&self) -> Result<DatabaseInfo> {
        let mut conn = self.connection().await?;
        let version = self.executor.execute_scalar(&internal(catalog::SERVER_VERSION)?, &mut conn).await?;
        let database = self.executor.execute_scalar(&internal(catalog::CURRENT_DATABASE)?, &mut conn).await?;
        let user = self.executor.execute_scalar(&internal(catalog::CURRENT_USER)?, &mut conn).await?;
        Ok(DatabaseInfo {
            version,
            database,
            user,
            host: self.config.database.host.clone(),
            port: self.config.database.port,
        })
    }

    /// Server identity plus a temp-table write round-trip.
    pub async fn test_connection(&self) -> Result<ConnectionTest> {
        let info = self.database_info().await?;
        let mut conn = self.connection().await?;

        self.executor.execute_write(&internal(catalog::WRITE_TEST_CREATE)?, &mut conn).await?;
        self.executor.execute_write(&internal(catalog::WRITE_TEST_INSERT)?, &mut conn).await?;
        let value = self.executor.execute_scalar(&internal(catalog::WRITE_TEST_SELECT)?, &mut conn).await?;
        self.executor.execute_write(&internal(catalog::WRITE_TEST_DROP)?, &mut conn).await?;

        let write_test = if value == Value::from(1) { "passed" } else { "failed" };
        info!("Connection test completed (write_test={})", write_test);
        Ok(ConnectionTest {
            status: "success".to_string(),
            message: "Database connection successful".to_string(),
            details: ConnectionDetails {
                status: "connected".to_string(),
                version: info.version,
                database: info.database,
                user: info.user,
                host: info.host,
                port: info.port,
                write_test: write_test.to_string(),
            },
        })
    }

    pub async fn list_databases(&self) -> Result<Vec<JsonRow>> {
        let mut conn = self.connection().await?;
        self.executor.execute_rows(&internal(catalog::LIST_DATABASES)?, &mut conn).await
    }

    pub async fn list_schemas(&self) -> Result<Vec<JsonRow>> {
        let mut conn = self.connection().await?;
        self.executor.execute_rows(&internal(catalog::LIST_SCHEMAS)?, &mut conn).await
    }

    pub async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<JsonRow>> {
        let stmt = match schema {
            Some(schema) => {
                let schema = schema_identifier(schema)?;
                PreparedStatement::new(
                    catalog::list_tables_in_schema(),
                    vec![SqlValue::Text(schema.into_inner())],
                )?
            }
            None => PreparedStatement::new(catalog::list_tables(), Vec::new())?,
        };
        let mut conn = self.connection().await?;
        self.executor.execute_rows(&stmt, &mut conn).await
    }

    // CRUD

    async fn ensure_table(
        &self,
        conn: &mut PooledConnection,
        schema: &SanitizedIdentifier,
        table: &SanitizedIdentifier,
    ) -> Result<()> {
        let exists = self
            .executor
            .execute_scalar(&build_table_exists(schema, table), conn)
            .await?;
        if exists == Value::Bool(true) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("Table {}.{} not found", schema, table)))
        }
    }

    pub async fn list_records(&self, schema: &str, table: &str, options: ListOptions) -> Result<RecordsResponse> {
        let (schema, table) = identifiers(schema, table)?;
        let select = SelectOptions {
            limit: Some(validate_limit(options.limit.unwrap_or(DEFAULT_LIMIT))?),
            offset: Some(validate_offset(options.offset.unwrap_or(0))?),
            order_by: options
                .order_by
                .as_deref()
                .filter(|o| !o.trim().is_empty())
                .map(OrderBy::parse)
                .transpose()?,
            ..Default::default()
        };
        let select = build_select(&schema, &table, &select)?;
        let count = build_count(&schema, &table, None);

        let mut conn = self.connection().await?;
        self.ensure_table(&mut conn, &schema, &table).await?;
        let total_count = self
            .executor
            .execute_scalar(&count, &mut conn)
            .await?
            .as_i64()
            .unwrap_or(0);
        let rows = self.executor.execute_rows(&select, &mut conn).await?;

        let records: Vec<RecordResponse> = rows.into_iter().map(RecordResponse::from).collect();
        Ok(RecordsResponse {
            count: records.len(),
            records,
            total_count,
        })
    }

    pub async fn get_record(&self, schema: &str, table: &str, raw_id: &str) -> Result<RecordResponse> {
        let (schema, table) = identifiers(schema, table)?;
        let stmt = build_select_by_id(&schema, &table, &RecordId::coerce(raw_id));

        let mut conn = self.connection().await?;
        self.ensure_table(&mut conn, &schema, &table).await?;
        self.executor
            .execute_row(&stmt, &mut conn)
            .await?
            .map(RecordResponse::from)
            .ok_or_else(|| record_not_found(raw_id))
    }

    pub async fn create_record(&self, schema: &str, table: &str, data: &JsonRow) -> Result<RecordResponse> {
        let (schema, table) = identifiers(schema, table)?;
        let stmt = build_insert(&schema, &table, data)?;

        let mut conn = self.connection().await?;
        self.ensure_table(&mut conn, &schema, &table).await?;
        let row = self
            .executor
            .execute_row(&stmt, &mut conn)
            .await?
            .ok_or_else(|| Error::ExecutionFailed("Failed to create record".to_string()))?;
        info!("Created record in {}.{}", schema, table);
        Ok(RecordResponse::from(row))
    }

    pub async fn update_record(
        &self,
        schema: &str,
        table: &str,
        raw_id: &str,
        data: &JsonRow,
    ) -> Result<RecordResponse> {
        let (schema, table) = identifiers(schema, table)?;
        let stmt = build_update(&schema, &table, &RecordId::coerce(raw_id), data)?;

        let mut conn = self.connection().await?;
        self.ensure_table(&mut conn, &schema, &table).await?;
        let row = self
            .executor
            .execute_row(&stmt, &mut conn)
            .await?
            .ok_or_else(|| record_not_found(raw_id))?;
        info!("Updated record {} in {}.{}", raw_id, schema, table);
        Ok(RecordResponse::from(row))
    }

    pub async fn delete_record(&self, schema: &str, table: &str, raw_id: &str) -> Result<DeleteResponse> {
        let (schema, table) = identifiers(schema, table)?;
        let stmt = build_delete(&schema, &table, &RecordId::coerce(raw_id));

        let mut conn = self.connection().await?;
        self.ensure_table(&mut conn, &schema, &table).await?;
        let row = self
            .executor
            .execute_row(&stmt, &mut conn)
            .await?
            .ok_or_else(|| record_not_found(raw_id))?;
        info!("Deleted record {} from {}.{}", raw_id, schema, table);
        Ok(DeleteResponse {
            message: "Record deleted successfully".to_string(),
            deleted_record: RecordResponse::from(row),
        })
    }

    /// Update the record if it exists, otherwise insert it under `raw_id`.
    pub async fn upsert_record(
        &self,
        schema: &str,
        table: &str,
        raw_id: &str,
        data: &JsonRow,
    ) -> Result<UpsertResponse> {
        let (schema, table) = identifiers(schema, table)?;
        let id = RecordId::coerce(raw_id);

        let mut with_id = JsonRow::new();
        with_id.insert("id".to_string(), id.to_json());
        with_id.extend(data.iter().filter(|(k, _)| k.as_str() != "id").map(|(k, v)| (k.clone(), v.clone())));
        let insert = build_insert(&schema, &table, &with_id)?;
        let update = if data.is_empty() {
            None
        } else {
            Some(build_update(&schema, &table, &id, data)?)
        };
        let exists = build_exists(&schema, &table, &id);

        let mut conn = self.connection().await?;
        self.ensure_table(&mut conn, &schema, &table).await?;
        let found = self.executor.execute_scalar(&exists, &mut conn).await? == Value::Bool(true);

        let (operation, stmt) = match (found, update) {
            (true, Some(update)) => (UpsertOperation::Updated, update),
            (true, None) => return Err(Error::InvalidRequest("No fields to update".to_string())),
            (false, _) => (UpsertOperation::Created, insert),
        };
        let row = self
            .executor
            .execute_row(&stmt, &mut conn)
            .await?
            .ok_or_else(|| record_not_found(raw_id))?;

        let message = match operation {
            UpsertOperation::Created => "Record created successfully",
            UpsertOperation::Updated => "Record updated successfully",
        };
        info!("Upsert of record {} in {}.{}: {:?}", raw_id, schema, table, operation);
        Ok(UpsertResponse {
            message: message.to_string(),
            operation,
            record: RecordResponse::from(row),
        })
    }

    // Raw and prepared SQL

    fn checked_statement(&self, request: &SqlRequest, mode: OperationMode) -> Result<PreparedStatement> {
        self.validator.validate(&request.sql, mode)?;
        let parameters = request.parameters.clone().unwrap_or_default();
        Ok(PreparedStatement::from_caller(request.sql.clone(), parameters)?.with_name(request.name.clone()))
    }

    async fn run(&self, request: SqlRequest, mode: OperationMode) -> Result<SqlResponse> {
        let stmt = self.checked_statement(&request, mode)?;
        debug!("Executing {} statement: {}", mode, stmt.sql());

        let mut conn = self.connection().await?;
        let response = match mode {
            OperationMode::Read => {
                let rows = self.executor.execute_rows(&stmt, &mut conn).await?;
                SqlResponse {
                    success: true,
                    message: format!("Query executed successfully. Rows returned: {}", rows.len()),
                    row_count: Some(rows.len()),
                    data: Some(rows),
                    affected_rows: None,
                    sql: request.sql,
                    parameters: request.parameters,
                }
            }
            OperationMode::Write => {
                let outcome = self.executor.execute_write(&stmt, &mut conn).await?;
                SqlResponse {
                    success: true,
                    message: format!(
                        "Write query executed successfully. Affected rows: {}",
                        outcome.affected_rows
                    ),
                    row_count: outcome.rows.as_ref().map(Vec::len),
                    data: outcome.rows,
                    affected_rows: Some(outcome.affected_rows),
                    sql: request.sql,
                    parameters: request.parameters,
                }
            }
        };
        Ok(response)
    }

    pub async fn query(&self, request: SqlRequest) -> Result<SqlResponse> {
        self.run(request, OperationMode::Read).await
    }

    pub async fn write(&self, request: SqlRequest) -> Result<SqlResponse> {
        self.run(request, OperationMode::Write).await
    }

    /// Run in the mode named by `operation_type` (read when absent).
    pub async fn execute(&self, request: SqlRequest) -> Result<SqlResponse> {
        let mode = request.mode()?;
        self.run(request, mode).await
    }

    /// Check a request without executing it.
    pub fn validate(&self, request: &SqlRequest) -> ValidationReport {
        let placeholders = placeholder_count(&request.sql);
        let parameter_count = request.parameters.as_ref().map(ParameterSet::len).unwrap_or(0);
        let outcome = request
            .mode()
            .and_then(|mode| self.checked_statement(request, mode).map(|_| mode));

        match outcome {
            Ok(mode) => ValidationReport {
                valid: true,
                message: "Prepared SQL statement is valid".to_string(),
                sql: request.sql.clone(),
                placeholder_count: placeholders,
                parameter_count,
                operation_type: Some(mode.to_string()),
                error: None,
            },
            Err(e) => {
                warn!("Validation failed: {}", e);
                ValidationReport {
                    valid: false,
                    message: "Prepared SQL statement is invalid".to_string(),
                    sql: request.sql.clone(),
                    placeholder_count: placeholders,
                    parameter_count,
                    operation_type: request.operation_type.clone(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn list_statements(&self) -> Vec<CachedStatement> {
        self.statements().list()
    }

    pub fn remove_statement(&self, name: &str) -> Result<()> {
        if self.statements().remove(name) {
            info!("Evicted prepared statement '{}'", name);
            Ok(())
        } else {
            Err(Error::NotFound(format!("Prepared statement '{}' not found", name)))
        }
    }

    pub fn clear_statements(&self) -> usize {
        let count = self.statements().clear();
        info!("Cleared {} prepared statements", count);
        count
    }
}

fn record_not_found(raw_id: &str) -> Error {
    Error::NotFound(format!("Record with ID {} not found", raw_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn gateway() -> Gateway {
        Gateway::new(GatewayConfig::default())
    }

    fn request(sql: &str, parameters: Value, operation_type: Option<&str>) -> SqlRequest {
        SqlRequest {
            sql: sql.to_string(),
            parameters: serde_json::from_value(parameters).unwrap(),
            operation_type: operation_type.map(str::to_string),
            name: None,
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn captured<T>(f: impl FnOnce() -> T) -> (T, String) {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let out = tracing::subscriber::with_default(subscriber, f);
        let text = String::from_utf8_lossy(&logs.0.lock()).into_owned();
        (out, text)
    }

    #[test]
    fn test_schema_rejections_are_audited() {
        let (result, logs) = captured(|| schema_identifier("bad-schema"));
        assert!(matches!(result, Err(Error::InvalidIdentifier(_))));
        assert!(logs.contains("event=identifier_rejected"), "{}", logs);

        let (result, logs) = captured(|| identifiers("public", "users;"));
        assert!(result.is_err());
        assert!(logs.contains("event=identifier_rejected"), "{}", logs);

        let (result, logs) = captured(|| schema_identifier("public"));
        assert!(result.is_ok());
        assert!(logs.is_empty());
    }

    #[test]
    fn test_record_response_lifts_fields() {
        let row = json!({"id": 3, "name": "A", "created_at": "2024-01-01T00:00:00+00:00"});
        let record = RecordResponse::from(row.as_object().cloned().unwrap());
        assert_eq!(record.id, json!(3));
        assert_eq!(record.created_at, json!("2024-01-01T00:00:00+00:00"));
        assert_eq!(record.updated_at, Value::Null);
        assert_eq!(record.data["name"], json!("A"));
    }

    #[test]
    fn test_validate_reports_without_executing() {
        let gw = gateway();
        let report = gw.validate(&request("SELECT * FROM t WHERE id = $1", json!({"1": 5}), None));
        assert!(report.valid);
        assert_eq!(report.placeholder_count, 1);
        assert_eq!(report.parameter_count, 1);
        assert_eq!(report.operation_type.as_deref(), Some("read"));

        let report = gw.validate(&request("SELECT * FROM t WHERE id = $1", json!(null), None));
        assert!(!report.valid);
        assert!(report.error.unwrap().contains("Parameter count mismatch"));

        let report = gw.validate(&request("DROP TABLE t", json!(null), Some("write")));
        assert!(!report.valid);
        assert_eq!(report.error.as_deref(), Some("SQL rejected: dangerous keyword 'DROP'"));

        let report = gw.validate(&request("SELECT 1", json!(null), Some("admin")));
        assert_eq!(report.error.as_deref(), Some("SQL rejected: Invalid operation type"));
    }

    #[tokio::test]
    async fn test_rejections_happen_before_the_pool() {
        let gw = gateway();
        let err = gw.list_records("public", "users;drop", ListOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)));

        let err = gw
            .list_records("public", "users", ListOptions { limit: Some(5000), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let err = gw.query(request("DELETE FROM t", json!(null), None)).await.unwrap_err();
        assert!(matches!(err, Error::SqlRejected(_)));

        let err = gw.write(request("UPDATE t SET a = $1 WHERE id = $2", json!([1]), None)).await.unwrap_err();
        assert_eq!(err, Error::ParameterMismatch { expected: 2, provided: 1 });

        assert!(!gw.pool_stats().created);
    }

    #[test]
    fn test_remove_unknown_statement() {
        let gw = gateway();
        assert_eq!(
            gw.remove_statement("nope"),
            Err(Error::NotFound("Prepared statement 'nope' not found".to_string()))
        );
        assert_eq!(gw.clear_statements(), 0);
    }
}
