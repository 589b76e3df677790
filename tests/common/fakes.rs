//! In-memory PostgreSQL and Secret backends
//!
//! [`FakeCluster`] keeps an [`ActualState`] behind a lock. Catalog reads
//! render it as the rows the system catalogs would return, and executed
//! operations are projected onto it with [`ActualState::apply`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use postgres_access_operator::controller::CycleServices;
use postgres_access_operator::credentials::{
    SecretLocation, SecretPayload, SecretStore, SecretStoreError,
};
use postgres_access_operator::crd::GrantObjectType;
use postgres_access_operator::engine::{ActualState, DatabaseState, ObjectRef, RoleState, SqlOperation};
use postgres_access_operator::postgres::catalog::{
    AclRow, AuthIdRow, AuthMemberRow, CatalogError, CatalogQuery, DatabaseRow, ObjectRow,
    RoleSettingRow,
};
use postgres_access_operator::postgres::{ExecError, SqlExecutor};

/// A PostgreSQL instance seen through one connection
#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<ActualState>>,
    executed: Arc<Mutex<Vec<SqlOperation>>>,
    /// Statements containing this text fail
    fail_on: Arc<Mutex<Option<String>>>,
    database: String,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// Empty cluster with the `postgres` maintenance database
    pub fn new() -> Self {
        let mut state = ActualState::default();
        state.roles.insert("postgres".to_string(), superuser());
        state.databases.insert(
            "postgres".to_string(),
            DatabaseState {
                owner: "postgres".to_string(),
                connection_limit: -1,
            },
        );
        Self::with_state(state)
    }

    pub fn with_state(state: ActualState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            executed: Arc::default(),
            fail_on: Arc::default(),
            database: "postgres".to_string(),
        }
    }

    /// The same cluster through a connection to `database`
    pub fn on(&self, database: &str) -> Self {
        Self {
            database: database.to_string(),
            ..self.clone()
        }
    }

    pub fn state(&self) -> ActualState {
        self.state.lock().unwrap().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut ActualState)) {
        f(&mut self.state.lock().unwrap());
    }

    /// Every statement applied so far, redacted
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(SqlOperation::redacted)
            .collect()
    }

    pub fn clear_log(&self) {
        self.executed.lock().unwrap().clear();
    }

    /// Fail every statement whose SQL contains `needle`
    pub fn fail_on(&self, needle: &str) {
        *self.fail_on.lock().unwrap() = Some(needle.to_string());
    }

    pub fn heal(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    /// Add a schema owned by `owner` to `database`
    pub fn add_schema(&self, database: &str, schema: &str, owner: &str) {
        self.update(|s| {
            s.objects.insert(
                ObjectRef::new(GrantObjectType::Schema, database, schema, ""),
                owner.to_string(),
            );
        });
    }

    /// Add a table owned by `owner`
    pub fn add_table(&self, database: &str, schema: &str, table: &str, owner: &str) {
        self.update(|s| {
            s.objects.insert(
                ObjectRef::new(GrantObjectType::Table, database, schema, table),
                owner.to_string(),
            );
        });
    }

    pub fn add_sequence(&self, database: &str, schema: &str, sequence: &str, owner: &str) {
        self.update(|s| {
            s.objects.insert(
                ObjectRef::new(GrantObjectType::Sequence, database, schema, sequence),
                owner.to_string(),
            );
        });
    }

    pub fn add_role(&self, name: &str) {
        self.update(|s| {
            s.roles.insert(name.to_string(), RoleState::default());
        });
    }

    pub fn add_database(&self, name: &str, owner: &str) {
        self.update(|s| {
            s.databases.insert(
                name.to_string(),
                DatabaseState {
                    owner: owner.to_string(),
                    connection_limit: -1,
                },
            );
        });
    }

    /// Backends for a cycle on this connection
    pub fn services<'a>(&'a self, secrets: &'a MemorySecretStore) -> CycleServices<'a> {
        CycleServices {
            catalog: self,
            executor: self,
            secrets,
        }
    }

    fn acl_rows(&self, filter: impl Fn(&ObjectRef) -> bool) -> Vec<AclRow> {
        let state = self.state.lock().unwrap();
        let mut rows = Vec::new();
        for ((grantee, object), entry) in &state.acls {
            if !filter(object) {
                continue;
            }
            let name = match object {
                ObjectRef::Database { name } => name.clone(),
                ObjectRef::Schema { name, .. } => name.clone(),
                other => other.relation().to_string(),
            };
            for (privilege, grantable) in entry {
                rows.push(AclRow {
                    object_type: object.object_type(),
                    schema: object.schema().to_string(),
                    name: name.clone(),
                    grantee: grantee.clone(),
                    privilege: *privilege,
                    grantable: *grantable,
                });
            }
        }
        rows
    }

    fn in_scope(&self, object: &ObjectRef, schemas: &[String]) -> bool {
        !matches!(object, ObjectRef::Database { .. })
            && object.database() == self.database
            && schemas.iter().any(|s| s == object.schema())
    }
}

fn superuser() -> RoleState {
    let mut role = RoleState::default();
    role.flags.superuser = true;
    role.flags.login = true;
    role.flags.createdb = true;
    role.flags.createrole = true;
    role.flags.replication = true;
    role.flags.bypassrls = true;
    role
}

#[async_trait]
impl CatalogQuery for FakeCluster {
    fn database(&self) -> &str {
        &self.database
    }

    async fn roles(&self) -> Result<Vec<AuthIdRow>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .roles
            .iter()
            .map(|(name, role)| AuthIdRow {
                name: name.clone(),
                superuser: role.flags.superuser,
                inherit: role.flags.inherit,
                createrole: role.flags.createrole,
                createdb: role.flags.createdb,
                login: role.flags.login,
                replication: role.flags.replication,
                bypassrls: role.flags.bypassrls,
                connection_limit: role.flags.connection_limit,
                valid_until: role.flags.valid_until,
                password: role.password.clone().filter(|_| !role.password_hidden),
                password_hidden: role.password_hidden,
                comment: role.comment.clone(),
            })
            .collect())
    }

    async fn memberships(&self) -> Result<Vec<AuthMemberRow>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .memberships
            .iter()
            .map(|m| AuthMemberRow {
                role: m.role.clone(),
                member: m.member.clone(),
                admin_option: false,
            })
            .collect())
    }

    async fn role_settings(&self) -> Result<Vec<RoleSettingRow>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .roles
            .iter()
            .filter(|(_, role)| !role.settings.is_empty())
            .map(|(name, role)| RoleSettingRow {
                role: name.clone(),
                config: role
                    .settings
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            })
            .collect())
    }

    async fn databases(&self) -> Result<Vec<DatabaseRow>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .databases
            .iter()
            .map(|(name, db)| DatabaseRow {
                name: name.clone(),
                owner: db.owner.clone(),
                connection_limit: db.connection_limit,
            })
            .collect())
    }

    async fn database_acls(&self) -> Result<Vec<AclRow>, CatalogError> {
        Ok(self.acl_rows(|object| matches!(object, ObjectRef::Database { .. })))
    }

    async fn namespace_objects(&self, schemas: &[String]) -> Result<Vec<ObjectRow>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|(object, _)| self.in_scope(object, schemas))
            .map(|(object, owner)| ObjectRow {
                object_type: object.object_type(),
                schema: object.schema().to_string(),
                name: match object {
                    ObjectRef::Schema { name, .. } => name.clone(),
                    other => other.relation().to_string(),
                },
                owner: owner.clone(),
            })
            .collect())
    }

    async fn namespace_acls(&self, schemas: &[String]) -> Result<Vec<AclRow>, CatalogError> {
        Ok(self.acl_rows(|object| self.in_scope(object, schemas)))
    }
}

#[async_trait]
impl SqlExecutor for FakeCluster {
    async fn execute(&self, operations: &[SqlOperation]) -> Result<usize, ExecError> {
        let fail_on = self.fail_on.lock().unwrap().clone();
        for (index, op) in operations.iter().enumerate() {
            let statement = op.to_sql();
            if fail_on.as_deref().is_some_and(|needle| statement.contains(needle)) {
                return Err(ExecError::Statement {
                    index,
                    statement: op.redacted(),
                    message: "injected failure".to_string(),
                    sqlstate: Some("XX000".to_string()),
                    applied: index,
                });
            }
            self.state.lock().unwrap().apply(op);
            self.executed.lock().unwrap().push(op.clone());
        }
        Ok(operations.len())
    }
}

/// Secret store backed by a map
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<(String, String), SecretPayload>>,
    writes: Mutex<Vec<SecretLocation>>,
}

impl MemorySecretStore {
    pub fn insert(&self, namespace: &str, name: &str, username: &str, password: &str) {
        self.secrets.lock().unwrap().insert(
            (namespace.to_string(), name.to_string()),
            SecretPayload {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
    }

    pub fn password(&self, namespace: &str, name: &str) -> Option<String> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .map(|p| p.password.clone())
    }

    pub fn username(&self, namespace: &str, name: &str) -> Option<String> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .map(|p| p.username.clone())
    }

    /// Locations written so far, in order
    pub fn writes(&self) -> Vec<SecretLocation> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(
        &self,
        location: &SecretLocation,
    ) -> Result<Option<SecretPayload>, SecretStoreError> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&(location.namespace.clone(), location.name.clone()))
            .cloned())
    }

    async fn put(
        &self,
        location: &SecretLocation,
        payload: &SecretPayload,
    ) -> Result<(), SecretStoreError> {
        self.secrets.lock().unwrap().insert(
            (location.namespace.clone(), location.name.clone()),
            payload.clone(),
        );
        self.writes.lock().unwrap().push(location.clone());
        Ok(())
    }
}
