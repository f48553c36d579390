pub mod error;
pub mod config;
pub mod identifier;
pub mod security;
pub mod value;
pub mod statement;
pub mod builder;

pub use error::{Error, ErrorKind, Result};
pub use config::{DatabaseConfig, GatewayConfig, LogFormat, PoolConfig, ServerConfig};
pub use identifier::{sanitize, sanitize_column, sanitize_schema, sanitize_table, SanitizedIdentifier};
pub use security::{AuditLogger, OperationMode, SqlValidator};
pub use value::{normalize_row, normalize_rows, JsonRow, RecordId, Row, SqlValue};
pub use statement::{placeholder_count, ParameterSet, PreparedStatement};
pub use builder::{OrderBy, SelectOptions, SortDirection, WhereClause};
