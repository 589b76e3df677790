//! Typed read access to PostgreSQL system catalogs
//!
//! Every query is a single read-only statement. Role, membership, role setting
//! and database rows come from shared catalogs and look the same from any
//! database; namespace and relation rows are local to the database the
//! connection is open on.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_postgres::Row;
use tracing::{debug, trace};

use crate::crd::{GrantObjectType, Privilege};

/// Errors raised while reading catalogs
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog query {query} failed: {message}")]
    Query { query: &'static str, message: String },

    #[error("Catalog query {query} timed out after {timeout:?}")]
    Timeout {
        query: &'static str,
        timeout: Duration,
    },
}

/// Row from `pg_authid`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthIdRow {
    pub name: String,
    pub superuser: bool,
    pub inherit: bool,
    pub createrole: bool,
    pub createdb: bool,
    pub login: bool,
    pub replication: bool,
    pub bypassrls: bool,
    pub connection_limit: i32,
    /// Finite `rolvaliduntil` as Unix seconds
    pub valid_until: Option<i64>,
    /// Stored password verifier (`SCRAM-SHA-256$...` or `md5...`)
    pub password: Option<String>,
    /// Verifiers were not readable; `password` is always `None`
    pub password_hidden: bool,
    pub comment: Option<String>,
}

/// Row from `pg_auth_members`: `member` is a member of `role`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthMemberRow {
    pub role: String,
    pub member: String,
    pub admin_option: bool,
}

/// Database-independent row from `pg_db_role_setting`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleSettingRow {
    pub role: String,
    /// `name=value` entries
    pub config: Vec<String>,
}

/// Row from `pg_database`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseRow {
    pub name: String,
    pub owner: String,
    pub connection_limit: i32,
}

/// A schema, table or sequence in the connected database
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRow {
    pub object_type: GrantObjectType,
    pub schema: String,
    /// Object name; equal to `schema` for schema rows
    pub name: String,
    pub owner: String,
}

/// One privilege from an exploded ACL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclRow {
    pub object_type: GrantObjectType,
    /// Empty for database ACLs
    pub schema: String,
    pub name: String,
    pub grantee: String,
    pub privilege: Privilege,
    pub grantable: bool,
}

impl ObjectRow {
    fn from_row(row: &Row) -> Option<Self> {
        let object_type: String = row.get("object_type");
        Some(Self {
            object_type: GrantObjectType::from_key(&object_type)?,
            schema: row.get("schema"),
            name: row.get("name"),
            owner: row.get("owner"),
        })
    }
}

impl AclRow {
    /// Rows with privilege types this operator does not manage (e.g. MAINTAIN) are skipped
    fn from_row(row: &Row) -> Option<Self> {
        let object_type: String = row.get("object_type");
        let privilege: String = row.get("privilege_type");
        Some(Self {
            object_type: GrantObjectType::from_key(&object_type)?,
            schema: row.get("schema"),
            name: row.get("name"),
            grantee: row.get("grantee"),
            privilege: Privilege::from_sql(&privilege)?,
            grantable: row.get("is_grantable"),
        })
    }
}

/// Read-only catalog access used to build the actual-state snapshot
#[async_trait]
pub trait CatalogQuery: Send + Sync {
    /// Database the connection is open on
    fn database(&self) -> &str;

    /// Every role, including the predefined `pg_*` roles
    async fn roles(&self) -> Result<Vec<AuthIdRow>, CatalogError>;

    async fn memberships(&self) -> Result<Vec<AuthMemberRow>, CatalogError>;

    /// Settings that apply to a role in every database
    async fn role_settings(&self) -> Result<Vec<RoleSettingRow>, CatalogError>;

    /// Non-template databases
    async fn databases(&self) -> Result<Vec<DatabaseRow>, CatalogError>;

    /// Exploded `datacl` entries of every non-template database
    async fn database_acls(&self) -> Result<Vec<AclRow>, CatalogError>;

    /// Schemas in `schemas` and the tables and sequences they contain
    async fn namespace_objects(&self, schemas: &[String]) -> Result<Vec<ObjectRow>, CatalogError>;

    /// Exploded `nspacl` and `relacl` entries for the objects in `schemas`
    async fn namespace_acls(&self, schemas: &[String]) -> Result<Vec<AclRow>, CatalogError>;
}

const AUTHID_READABLE_QUERY: &str = r#"
    SELECT has_table_privilege('pg_catalog.pg_authid', 'SELECT') AS readable
"#;

const ROLES_QUERY: &str = r#"
    SELECT r.rolname::text AS name,
           r.rolsuper, r.rolinherit, r.rolcreaterole, r.rolcreatedb,
           r.rolcanlogin, r.rolreplication, r.rolbypassrls, r.rolconnlimit,
           CASE WHEN isfinite(r.rolvaliduntil)
                THEN extract(epoch FROM r.rolvaliduntil)::bigint END AS valid_until,
           r.rolpassword,
           shobj_description(r.oid, 'pg_authid') AS comment
    FROM pg_authid r
    ORDER BY r.rolname
"#;

/// `pg_roles` masks the verifier, so none is read
const ROLES_VISIBLE_QUERY: &str = r#"
    SELECT r.rolname::text AS name,
           r.rolsuper, r.rolinherit, r.rolcreaterole, r.rolcreatedb,
           r.rolcanlogin, r.rolreplication, r.rolbypassrls, r.rolconnlimit,
           CASE WHEN isfinite(r.rolvaliduntil)
                THEN extract(epoch FROM r.rolvaliduntil)::bigint END AS valid_until,
           NULL::text AS rolpassword,
           shobj_description(r.oid, 'pg_authid') AS comment
    FROM pg_roles r
    ORDER BY r.rolname
"#;

const MEMBERSHIPS_QUERY: &str = r#"
    SELECT r.rolname::text AS role, m.rolname::text AS member, am.admin_option
    FROM pg_auth_members am
    JOIN pg_roles r ON r.oid = am.roleid
    JOIN pg_roles m ON m.oid = am.member
    ORDER BY 1, 2
"#;

const ROLE_SETTINGS_QUERY: &str = r#"
    SELECT r.rolname::text AS role, s.setconfig
    FROM pg_db_role_setting s
    JOIN pg_roles r ON r.oid = s.setrole
    WHERE s.setdatabase = 0
"#;

const DATABASES_QUERY: &str = r#"
    SELECT d.datname::text AS name,
           pg_get_userbyid(d.datdba)::text AS owner,
           d.datconnlimit
    FROM pg_database d
    WHERE NOT d.datistemplate
    ORDER BY d.datname
"#;

const DATABASE_ACLS_QUERY: &str = r#"
    SELECT 'database' AS object_type, '' AS schema, d.datname::text AS name,
           g.rolname::text AS grantee, a.privilege_type, a.is_grantable
    FROM pg_database d
    CROSS JOIN LATERAL aclexplode(d.datacl) a
    JOIN pg_roles g ON g.oid = a.grantee
    WHERE NOT d.datistemplate
"#;

const NAMESPACE_OBJECTS_QUERY: &str = r#"
    SELECT 'schema' AS object_type, n.nspname::text AS schema, n.nspname::text AS name,
           pg_get_userbyid(n.nspowner)::text AS owner
    FROM pg_namespace n
    WHERE n.nspname::text = ANY($1)
    UNION ALL
    SELECT CASE WHEN c.relkind = 'S' THEN 'sequence' ELSE 'table' END,
           n.nspname::text, c.relname::text,
           pg_get_userbyid(c.relowner)::text
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind IN ('r', 'p', 'v', 'm', 'f', 'S')
      AND n.nspname::text = ANY($1)
"#;

const NAMESPACE_ACLS_QUERY: &str = r#"
    SELECT 'schema' AS object_type, n.nspname::text AS schema, n.nspname::text AS name,
           g.rolname::text AS grantee, a.privilege_type, a.is_grantable
    FROM pg_namespace n
    CROSS JOIN LATERAL aclexplode(n.nspacl) a
    JOIN pg_roles g ON g.oid = a.grantee
    WHERE n.nspname::text = ANY($1)
    UNION ALL
    SELECT CASE WHEN c.relkind = 'S' THEN 'sequence' ELSE 'table' END,
           n.nspname::text, c.relname::text,
           g.rolname::text, a.privilege_type, a.is_grantable
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    CROSS JOIN LATERAL aclexplode(c.relacl) a
    JOIN pg_roles g ON g.oid = a.grantee
    WHERE c.relkind IN ('r', 'p', 'v', 'm', 'f', 'S')
      AND n.nspname::text = ANY($1)
"#;

/// [`CatalogQuery`] over a live connection
pub struct PgCatalog<'a> {
    client: &'a tokio_postgres::Client,
    database: String,
    timeout: Duration,
}

impl<'a> PgCatalog<'a> {
    pub fn new(client: &'a tokio_postgres::Client, database: &str, timeout: Duration) -> Self {
        Self {
            client,
            database: database.to_string(),
            timeout,
        }
    }

    async fn run<F>(&self, query: &'static str, fut: F) -> Result<Vec<Row>, CatalogError>
    where
        F: Future<Output = Result<Vec<Row>, tokio_postgres::Error>> + Send,
    {
        trace!(query = query, database = %self.database, "Reading catalog");
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => Err(CatalogError::Query {
                query,
                message: e.to_string(),
            }),
            Err(_) => Err(CatalogError::Timeout {
                query,
                timeout: self.timeout,
            }),
        }
    }
}

/// Role query for a connection that can or cannot read `pg_authid`
fn roles_query(authid_readable: bool) -> (&'static str, &'static str) {
    if authid_readable {
        ("roles", ROLES_QUERY)
    } else {
        ("roles_visible", ROLES_VISIBLE_QUERY)
    }
}

#[async_trait]
impl CatalogQuery for PgCatalog<'_> {
    fn database(&self) -> &str {
        &self.database
    }

    async fn roles(&self) -> Result<Vec<AuthIdRow>, CatalogError> {
        let readable = self
            .run("authid_readable", self.client.query(AUTHID_READABLE_QUERY, &[]))
            .await?
            .first()
            .is_some_and(|row| row.get::<_, bool>("readable"));
        let (label, query) = roles_query(readable);
        if !readable {
            debug!("pg_authid is not readable, password verifiers are unavailable");
        }
        let rows = self.run(label, self.client.query(query, &[])).await?;
        Ok(rows
            .iter()
            .map(|row| AuthIdRow {
                name: row.get("name"),
                superuser: row.get("rolsuper"),
                inherit: row.get("rolinherit"),
                createrole: row.get("rolcreaterole"),
                createdb: row.get("rolcreatedb"),
                login: row.get("rolcanlogin"),
                replication: row.get("rolreplication"),
                bypassrls: row.get("rolbypassrls"),
                connection_limit: row.get("rolconnlimit"),
                valid_until: row.get("valid_until"),
                password: row.get("rolpassword"),
                password_hidden: !readable,
                comment: row.get("comment"),
            })
            .collect())
    }

    async fn memberships(&self) -> Result<Vec<AuthMemberRow>, CatalogError> {
        let rows = self
            .run("memberships", self.client.query(MEMBERSHIPS_QUERY, &[]))
            .await?;
        Ok(rows
            .iter()
            .map(|row| AuthMemberRow {
                role: row.get("role"),
                member: row.get("member"),
                admin_option: row.get("admin_option"),
            })
            .collect())
    }

    async fn role_settings(&self) -> Result<Vec<RoleSettingRow>, CatalogError> {
        let rows = self
            .run("role_settings", self.client.query(ROLE_SETTINGS_QUERY, &[]))
            .await?;
        Ok(rows
            .iter()
            .map(|row| RoleSettingRow {
                role: row.get("role"),
                config: row
                    .get::<_, Option<Vec<String>>>("setconfig")
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn databases(&self) -> Result<Vec<DatabaseRow>, CatalogError> {
        let rows = self
            .run("databases", self.client.query(DATABASES_QUERY, &[]))
            .await?;
        Ok(rows
            .iter()
            .map(|row| DatabaseRow {
                name: row.get("name"),
                owner: row.get("owner"),
                connection_limit: row.get("datconnlimit"),
            })
            .collect())
    }

    async fn database_acls(&self) -> Result<Vec<AclRow>, CatalogError> {
        let rows = self
            .run("database_acls", self.client.query(DATABASE_ACLS_QUERY, &[]))
            .await?;
        Ok(rows.iter().filter_map(AclRow::from_row).collect())
    }

    async fn namespace_objects(&self, schemas: &[String]) -> Result<Vec<ObjectRow>, CatalogError> {
        if schemas.is_empty() {
            return Ok(Vec::new());
        }
        let schemas = schemas.to_vec();
        let rows = self
            .run(
                "namespace_objects",
                self.client.query(NAMESPACE_OBJECTS_QUERY, &[&schemas]),
            )
            .await?;
        Ok(rows.iter().filter_map(ObjectRow::from_row).collect())
    }

    async fn namespace_acls(&self, schemas: &[String]) -> Result<Vec<AclRow>, CatalogError> {
        if schemas.is_empty() {
            return Ok(Vec::new());
        }
        let schemas = schemas.to_vec();
        let rows = self
            .run(
                "namespace_acls",
                self.client.query(NAMESPACE_ACLS_QUERY, &[&schemas]),
            )
            .await?;
        Ok(rows.iter().filter_map(AclRow::from_row).collect())
    }
}
