//! PostgreSQL connectivity, catalog queries and statement execution

pub mod catalog;
pub mod config;
pub mod executor;
pub mod pool;
pub mod sql;

pub use catalog::{CatalogError, CatalogQuery, PgCatalog};
pub use config::{ConfigError, OperatorConfig, PostgresSettings, SslMode};
pub use executor::{ExecError, PgExecutor, SqlExecutor};
pub use pool::{Connection, PoolError, PoolRegistry};
