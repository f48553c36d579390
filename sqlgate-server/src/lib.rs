pub mod pool;
pub mod runner;
pub mod executor;
pub mod catalog;
pub mod gateway;
pub mod http;

pub use executor::{CachedStatement, StatementCache, StatementExecutor, WriteOutcome};
pub use gateway::{Gateway, ListOptions, SqlRequest, SqlResponse, ValidationReport};
pub use http::create_router;
pub use pool::{PoolError, PoolManager, PoolStats, PooledConnection};
pub use runner::StatementRunner;
