//! Connection pools for the managed PostgreSQL instance
//!
//! Grants on schemas and relations must be issued from a session connected to
//! the database that holds them, so the registry keeps one lazily created pool
//! per database name. Role and database DDL use the maintenance database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use rustls::pki_types::{CertificateDer, ServerName};
use thiserror::Error;
use tokio_postgres::NoTls;
use tokio_postgres::error::SqlState;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info};

use super::config::{PostgresSettings, SslMode};

/// A pooled connection, returned to its pool on drop
pub type Connection = deadpool_postgres::Object;

/// Errors raised while acquiring a connection
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Database {0} does not exist")]
    DatabaseMissing(String),

    #[error("Failed to connect to database {database}: {message}")]
    Connect { database: String, message: String },

    #[error("Timed out waiting for a connection to database {0}")]
    Timeout(String),

    #[error("Connection pools are closed")]
    Closed,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

/// Lazily populated map of database name to connection pool
pub struct PoolRegistry {
    settings: PostgresSettings,
    tls: Option<MakeRustlsConnect>,
    pools: Mutex<HashMap<String, Pool>>,
}

impl PoolRegistry {
    /// Create the registry; no connection is opened until first use
    pub fn new(settings: PostgresSettings) -> Result<Self, PoolError> {
        let tls = build_tls_connector(&settings.ssl_mode)?;
        Ok(Self {
            settings,
            tls,
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Database used for role and database DDL
    pub fn maintenance_database(&self) -> &str {
        &self.settings.maintenance_database
    }

    /// Per-operation timeout applied to catalog reads and statements
    pub fn operation_timeout(&self) -> std::time::Duration {
        self.settings.operation_timeout
    }

    /// Acquire a connection to `database`
    pub async fn connection(&self, database: &str) -> Result<Connection, PoolError> {
        let pool = self.pool_for(database)?;
        pool.get().await.map_err(|e| map_pool_error(database, e))
    }

    /// Close and forget the pool for `database`
    ///
    /// `DROP DATABASE` fails while idle pooled sessions are still connected.
    pub fn evict(&self, database: &str) {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = pools.remove(database) {
            debug!(database = %database, "Evicting connection pool");
            pool.close();
        }
    }

    /// Close every pool; outstanding connections are dropped when returned
    pub fn close(&self) {
        let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        for (database, pool) in pools.iter() {
            debug!(database = %database, "Closing connection pool");
            pool.close();
        }
        info!(pools = pools.len(), "Closed PostgreSQL connection pools");
    }

    fn pool_for(&self, database: &str) -> Result<Pool, PoolError> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = pools.get(database) {
            if pool.is_closed() {
                return Err(PoolError::Closed);
            }
            return Ok(pool.clone());
        }

        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.settings.host)
            .port(self.settings.port)
            .user(&self.settings.user)
            .password(&self.settings.password)
            .dbname(database)
            .application_name("postgres-access-operator")
            .connect_timeout(self.settings.operation_timeout);

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Clean,
        };
        let manager = match &self.tls {
            Some(tls) => Manager::from_config(config, tls.clone(), manager_config),
            None => Manager::from_config(config, NoTls, manager_config),
        };

        let pool = Pool::builder(manager)
            .max_size(self.settings.pool_max_size)
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(self.settings.operation_timeout))
            .create_timeout(Some(self.settings.operation_timeout))
            .recycle_timeout(Some(self.settings.operation_timeout))
            .build()
            .map_err(|e| PoolError::Connect {
                database: database.to_string(),
                message: e.to_string(),
            })?;

        debug!(database = %database, max_size = self.settings.pool_max_size, "Created connection pool");
        pools.insert(database.to_string(), pool.clone());
        Ok(pool)
    }
}

fn map_pool_error(database: &str, error: deadpool_postgres::PoolError) -> PoolError {
    match error {
        deadpool_postgres::PoolError::Backend(e) if e.code() == Some(&SqlState::INVALID_CATALOG_NAME) => {
            PoolError::DatabaseMissing(database.to_string())
        }
        deadpool_postgres::PoolError::Timeout(_) => PoolError::Timeout(database.to_string()),
        deadpool_postgres::PoolError::Closed => PoolError::Closed,
        other => PoolError::Connect {
            database: database.to_string(),
            message: other.to_string(),
        },
    }
}

fn build_tls_connector(mode: &SslMode) -> Result<Option<MakeRustlsConnect>, PoolError> {
    match mode {
        SslMode::Disable => Ok(None),
        SslMode::Require => {
            let config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth();
            Ok(Some(MakeRustlsConnect::new(config)))
        }
        SslMode::VerifyFull { ca_cert_path } => {
            let pem = std::fs::read(ca_cert_path).map_err(|e| {
                PoolError::TlsConfig(format!("Failed to read {}: {}", ca_cert_path.display(), e))
            })?;

            let mut root_store = rustls::RootCertStore::empty();
            let mut reader = std::io::BufReader::new(pem.as_slice());
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert
                    .map_err(|e| PoolError::TlsConfig(format!("Failed to parse certificate: {}", e)))?;
                root_store
                    .add(cert)
                    .map_err(|e| PoolError::TlsConfig(format!("Failed to add CA cert: {}", e)))?;
            }
            if root_store.is_empty() {
                return Err(PoolError::TlsConfig(format!(
                    "No certificates found in {}",
                    ca_cert_path.display()
                )));
            }

            let config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            Ok(Some(MakeRustlsConnect::new(config)))
        }
    }
}

/// Certificate verifier for `PGSSLMODE=require`, which encrypts without authenticating
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|provider| {
                provider
                    .signature_verification_algorithms
                    .supported_schemes()
            })
            .unwrap_or_default()
    }
}
