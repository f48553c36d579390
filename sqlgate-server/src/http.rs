// HTTP routes for the database gateway

use crate::gateway::{
    ConnectionTest, DatabaseInfo, DeleteResponse, Gateway, ListOptions, RecordResponse,
    RecordsResponse, SqlRequest, SqlResponse, UpsertResponse,
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlgate_core::{Error, ErrorKind, JsonRow};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

pub type AppState = Arc<Gateway>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Gateway error rendered as `{error, code}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidIdentifier
        | ErrorKind::SqlRejected
        | ErrorKind::ParameterMismatch
        | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::StatementConflict => StatusCode::CONFLICT,
        ErrorKind::PoolUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ExecutionFailed | ErrorKind::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected ({}): {}", kind.code(), self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: kind.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(Error::InvalidRequest(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(Error::InvalidRequest(rejection.body_text()))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// JSON request body whose rejections use the `{error, code}` envelope.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct JsonBody<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
pub struct QueryParams<T>(pub T);

#[derive(Debug, Deserialize)]
pub struct RecordBody {
    #[serde(default)]
    pub data: JsonRow,
}

/// Create the router with every gateway route.
pub fn create_router(gateway: AppState) -> Router {
    let admin: Router<AppState> = Router::new()
        .route("/admin/health", get(admin_health_handler))
        .route("/admin/test-connection", get(test_connection_handler))
        .route("/admin/db-info", get(db_info_handler))
        .route("/admin/databases", get(databases_handler))
        .route("/admin/schemas", get(schemas_handler))
        .route("/admin/tables", get(tables_handler))
        .route("/admin/tables/:schema", get(schema_tables_handler))
        .route("/admin/pool-stats", get(pool_stats_handler));

    let raw: Router<AppState> = Router::new()
        .route("/raw/sql", post(raw_read_handler))
        .route("/raw/sql/write", post(raw_write_handler));

    // Static prepared routes take precedence over the /crud/:schema/:table captures
    let prepared: Router<AppState> = Router::new()
        .route("/crud/prepared/execute", post(prepared_execute_handler))
        .route("/crud/prepared/select", post(raw_read_handler))
        .route("/crud/prepared/insert", post(raw_write_handler))
        .route("/crud/prepared/update", post(raw_write_handler))
        .route("/crud/prepared/delete", post(raw_write_handler))
        .route("/crud/prepared/validate", post(prepared_validate_handler))
        .route(
            "/crud/prepared/statements",
            get(list_statements_handler).delete(clear_statements_handler),
        )
        .route("/crud/prepared/statements/:name", delete(remove_statement_handler));

    let crud: Router<AppState> = Router::new()
        .route(
            "/crud/:schema/:table",
            get(list_records_handler).post(create_record_handler),
        )
        .route(
            "/crud/:schema/:table/:id",
            get(get_record_handler)
                .put(update_record_handler)
                .patch(upsert_record_handler)
                .delete(delete_record_handler),
        );

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .merge(admin)
        .merge(raw)
        .merge(prepared)
        .merge(crud)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": "sqlgate",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "HTTP gateway over PostgreSQL with validated, parameterized SQL",
        "endpoints": {
            "health": "/health",
            "admin": "/admin",
            "raw_sql": "/raw/sql",
            "crud": "/crud/{schema}/{table}",
            "prepared": "/crud/prepared",
        },
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "message": "SQLGate is running",
        "version": env!("CARGO_PKG_VERSION"),
        "detailed_health": "/admin/health",
    }))
}

// Admin

async fn admin_health_handler(State(gateway): State<AppState>) -> Response {
    match gateway.health().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            error!("Health check failed: {}", e);
            let body = json!({
                "status": "unhealthy",
                "database": "disconnected",
                "error": e.to_string(),
            });
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

async fn test_connection_handler(State(gateway): State<AppState>) -> ApiResult<ConnectionTest> {
    Ok(Json(gateway.test_connection().await?))
}

async fn db_info_handler(State(gateway): State<AppState>) -> ApiResult<DatabaseInfo> {
    Ok(Json(gateway.database_info().await?))
}

async fn databases_handler(State(gateway): State<AppState>) -> ApiResult<serde_json::Value> {
    let databases = gateway.list_databases().await?;
    Ok(Json(json!({ "count": databases.len(), "databases": databases })))
}

async fn schemas_handler(State(gateway): State<AppState>) -> ApiResult<serde_json::Value> {
    let schemas = gateway.list_schemas().await?;
    Ok(Json(json!({ "count": schemas.len(), "schemas": schemas })))
}

async fn tables_handler(State(gateway): State<AppState>) -> ApiResult<serde_json::Value> {
    let tables = gateway.list_tables(None).await?;
    Ok(Json(json!({ "count": tables.len(), "tables": tables })))
}

async fn schema_tables_handler(
    State(gateway): State<AppState>,
    Path(schema): Path<String>,
) -> ApiResult<serde_json::Value> {
    let tables = gateway.list_tables(Some(&schema)).await?;
    Ok(Json(json!({
        "schema_name": schema,
        "count": tables.len(),
        "tables": tables,
    })))
}

async fn pool_stats_handler(State(gateway): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "pool": gateway.pool_stats(),
        "cached_statements": gateway.statements().len(),
    }))
}

// Raw and prepared SQL

async fn raw_read_handler(
    State(gateway): State<AppState>,
    JsonBody(request): JsonBody<SqlRequest>,
) -> ApiResult<SqlResponse> {
    Ok(Json(gateway.query(request).await?))
}

async fn raw_write_handler(
    State(gateway): State<AppState>,
    JsonBody(request): JsonBody<SqlRequest>,
) -> ApiResult<SqlResponse> {
    Ok(Json(gateway.write(request).await?))
}

async fn prepared_execute_handler(
    State(gateway): State<AppState>,
    JsonBody(request): JsonBody<SqlRequest>,
) -> ApiResult<SqlResponse> {
    Ok(Json(gateway.execute(request).await?))
}

async fn prepared_validate_handler(
    State(gateway): State<AppState>,
    JsonBody(request): JsonBody<SqlRequest>,
) -> impl IntoResponse {
    Json(gateway.validate(&request))
}

async fn list_statements_handler(State(gateway): State<AppState>) -> impl IntoResponse {
    let statements = gateway.list_statements();
    Json(json!({
        "count": statements.len(),
        "statements": statements,
        "message": format!("{} prepared statements cached", statements.len()),
    }))
}

async fn clear_statements_handler(State(gateway): State<AppState>) -> impl IntoResponse {
    let cleared = gateway.clear_statements();
    Json(json!({
        "cleared": cleared,
        "message": "Prepared statement cache cleared",
    }))
}

async fn remove_statement_handler(
    State(gateway): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<serde_json::Value> {
    gateway.remove_statement(&name)?;
    Ok(Json(json!({
        "message": format!("Prepared statement '{}' removed", name),
    })))
}

// CRUD

async fn list_records_handler(
    State(gateway): State<AppState>,
    Path((schema, table)): Path<(String, String)>,
    QueryParams(options): QueryParams<ListOptions>,
) -> ApiResult<RecordsResponse> {
    Ok(Json(gateway.list_records(&schema, &table, options).await?))
}

async fn create_record_handler(
    State(gateway): State<AppState>,
    Path((schema, table)): Path<(String, String)>,
    JsonBody(body): JsonBody<RecordBody>,
) -> Result<impl IntoResponse, ApiError> {
    let record = gateway.create_record(&schema, &table, &body.data).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_record_handler(
    State(gateway): State<AppState>,
    Path((schema, table, id)): Path<(String, String, String)>,
) -> ApiResult<RecordResponse> {
    Ok(Json(gateway.get_record(&schema, &table, &id).await?))
}

async fn update_record_handler(
    State(gateway): State<AppState>,
    Path((schema, table, id)): Path<(String, String, String)>,
    JsonBody(body): JsonBody<RecordBody>,
) -> ApiResult<RecordResponse> {
    Ok(Json(gateway.update_record(&schema, &table, &id, &body.data).await?))
}

async fn upsert_record_handler(
    State(gateway): State<AppState>,
    Path((schema, table, id)): Path<(String, String, String)>,
    JsonBody(body): JsonBody<RecordBody>,
) -> ApiResult<UpsertResponse> {
    Ok(Json(gateway.upsert_record(&schema, &table, &id, &body.data).await?))
}

async fn delete_record_handler(
    State(gateway): State<AppState>,
    Path((schema, table, id)): Path<(String, String, String)>,
) -> ApiResult<DeleteResponse> {
    Ok(Json(gateway.delete_record(&schema, &table, &id).await?))
}
