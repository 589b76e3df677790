//! Actual-state snapshot built from the system catalogs
//!
//! A snapshot is rebuilt for every reconciliation and never written back to
//! PostgreSQL. [`ActualState::apply`] projects the effect of an operation onto
//! a copy so the cycle can record what it now owns without a second read.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::crd::{GrantObjectType, Privilege};
use crate::postgres::catalog::{AclRow, CatalogError, CatalogQuery};
use crate::postgres::sql::normalize_setting_value;

use super::object::{Membership, ObjectRef};
use super::operation::{RoleFlags, SqlOperation};

/// A role as it exists in `pg_authid`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleState {
    pub flags: RoleFlags,
    /// Stored verifier, if any
    pub password: Option<String>,
    /// `pg_authid` was not readable, so `password` is unknown
    pub password_hidden: bool,
    pub comment: Option<String>,
    /// Database-independent settings
    pub settings: BTreeMap<String, String>,
}

/// A database as it exists in `pg_database`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseState {
    pub owner: String,
    pub connection_limit: i32,
}

/// ACL entry identity: privileges `grantee` holds on `object`
pub type AclKey = (String, ObjectRef);

/// Privilege to grant-option map of one ACL entry
pub type AclEntry = BTreeMap<Privilege, bool>;

/// Structural snapshot of the role, grant and ownership state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActualState {
    pub roles: BTreeMap<String, RoleState>,
    pub memberships: BTreeSet<Membership>,
    pub databases: BTreeMap<String, DatabaseState>,
    /// Schemas, tables and sequences in scope, with their owner
    pub objects: BTreeMap<ObjectRef, String>,
    pub acls: BTreeMap<AclKey, AclEntry>,
}

/// Which database-local objects a reconciliation needs to see
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadScope {
    pub schemas: BTreeSet<String>,
}

/// Read the actual state through `catalog`
///
/// Shared catalogs are always read in full; namespace objects and their ACLs
/// only for the schemas in `scope`.
pub async fn read_actual_state(
    catalog: &dyn CatalogQuery,
    scope: &ReadScope,
) -> Result<ActualState, CatalogError> {
    let database = catalog.database().to_string();
    let mut state = ActualState::default();

    for row in catalog.roles().await? {
        state.roles.insert(
            row.name,
            RoleState {
                flags: RoleFlags {
                    superuser: row.superuser,
                    login: row.login,
                    createdb: row.createdb,
                    createrole: row.createrole,
                    inherit: row.inherit,
                    replication: row.replication,
                    bypassrls: row.bypassrls,
                    connection_limit: row.connection_limit,
                    valid_until: row.valid_until,
                },
                password: row.password,
                password_hidden: row.password_hidden,
                comment: row.comment,
                settings: BTreeMap::new(),
            },
        );
    }

    for row in catalog.role_settings().await? {
        if let Some(role) = state.roles.get_mut(&row.role) {
            for entry in row.config {
                if let Some((key, value)) = entry.split_once('=') {
                    role.settings
                        .insert(key.to_string(), normalize_setting_value(key, value));
                }
            }
        }
    }

    for row in catalog.memberships().await? {
        state
            .memberships
            .insert(Membership::new(row.role, row.member));
    }

    for row in catalog.databases().await? {
        state.databases.insert(
            row.name,
            DatabaseState {
                owner: row.owner,
                connection_limit: row.connection_limit,
            },
        );
    }

    for row in catalog.database_acls().await? {
        insert_acl(&mut state, &database, row);
    }

    let schemas: Vec<String> = scope.schemas.iter().cloned().collect();
    if !schemas.is_empty() {
        for row in catalog.namespace_objects(&schemas).await? {
            let object = ObjectRef::new(row.object_type, &database, &row.schema, &row.name);
            state.objects.insert(object, row.owner);
        }
        for row in catalog.namespace_acls(&schemas).await? {
            insert_acl(&mut state, &database, row);
        }
    }

    debug!(
        database = %database,
        roles = state.roles.len(),
        databases = state.databases.len(),
        objects = state.objects.len(),
        acl_entries = state.acls.len(),
        "Read actual state"
    );
    Ok(state)
}

fn insert_acl(state: &mut ActualState, database: &str, row: AclRow) {
    let object = match row.object_type {
        GrantObjectType::Database => ObjectRef::new(row.object_type, &row.name, "", ""),
        other => ObjectRef::new(other, database, &row.schema, &row.name),
    };
    let entry = state.acls.entry((row.grantee, object)).or_default();
    // aclexplode yields one row per grantor; any grantable row makes it grantable
    let grantable = entry.entry(row.privilege).or_insert(false);
    *grantable |= row.grantable;
}

impl ActualState {
    pub fn has_role(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    /// Whether a database, schema, table or sequence exists
    pub fn has_object(&self, object: &ObjectRef) -> bool {
        match object {
            ObjectRef::Database { name } => self.has_database(name),
            other => self.objects.contains_key(other),
        }
    }

    /// Owner of a schema, table or sequence
    pub fn object_owner(&self, object: &ObjectRef) -> Option<&str> {
        match object {
            ObjectRef::Database { name } => self.databases.get(name).map(|d| d.owner.as_str()),
            other => self.objects.get(other).map(String::as_str),
        }
    }

    /// Privileges `grantee` holds on `object`
    pub fn acl(&self, grantee: &str, object: &ObjectRef) -> Option<&AclEntry> {
        self.acls.get(&(grantee.to_string(), object.clone()))
    }

    /// Project the effect of `op` onto this snapshot
    pub fn apply(&mut self, op: &SqlOperation) {
        match op {
            SqlOperation::CreateRole { name, attributes } => {
                let mut flags = RoleFlags::default();
                flags.apply(attributes);
                self.roles.insert(
                    name.clone(),
                    RoleState {
                        flags,
                        ..Default::default()
                    },
                );
            }
            SqlOperation::AlterRole { name, attributes } => {
                if let Some(role) = self.roles.get_mut(name) {
                    role.flags.apply(attributes);
                }
            }
            SqlOperation::SetRoleConfig {
                name,
                setting,
                value,
            } => {
                if let Some(role) = self.roles.get_mut(name) {
                    role.settings.insert(setting.clone(), value.clone());
                }
            }
            SqlOperation::ResetRoleConfig { name, setting } => {
                if let Some(role) = self.roles.get_mut(name) {
                    role.settings.remove(setting);
                }
            }
            SqlOperation::CommentOnRole { name, comment } => {
                if let Some(role) = self.roles.get_mut(name) {
                    role.comment = comment.clone();
                }
            }
            SqlOperation::SetPassword { name, verifier } => {
                if let Some(role) = self.roles.get_mut(name) {
                    role.password = Some(verifier.clone());
                }
            }
            SqlOperation::CreateDatabase {
                name,
                owner,
                connection_limit,
            } => {
                self.databases.insert(
                    name.clone(),
                    DatabaseState {
                        owner: owner.clone(),
                        connection_limit: *connection_limit,
                    },
                );
            }
            SqlOperation::AlterDatabaseOwner { name, owner } => {
                if let Some(db) = self.databases.get_mut(name) {
                    db.owner = owner.clone();
                }
            }
            SqlOperation::AlterDatabaseConnectionLimit {
                name,
                connection_limit,
            } => {
                if let Some(db) = self.databases.get_mut(name) {
                    db.connection_limit = *connection_limit;
                }
            }
            SqlOperation::Grant {
                object,
                privileges,
                grantee,
                with_grant_option,
            } => {
                let entry = self
                    .acls
                    .entry((grantee.clone(), object.clone()))
                    .or_default();
                for privilege in privileges {
                    let grantable = entry.entry(*privilege).or_insert(false);
                    *grantable |= *with_grant_option;
                }
            }
            SqlOperation::Revoke {
                object,
                privileges,
                grantee,
                grant_option_only,
            } => {
                let key = (grantee.clone(), object.clone());
                if let Some(entry) = self.acls.get_mut(&key) {
                    for privilege in privileges {
                        if *grant_option_only {
                            if let Some(grantable) = entry.get_mut(privilege) {
                                *grantable = false;
                            }
                        } else {
                            entry.remove(privilege);
                        }
                    }
                    if entry.is_empty() {
                        self.acls.remove(&key);
                    }
                }
            }
            SqlOperation::GrantMembership(m) => {
                self.memberships.insert(m.clone());
            }
            SqlOperation::RevokeMembership(m) => {
                self.memberships.remove(m);
            }
            SqlOperation::DropDatabase { name } => {
                self.databases.remove(name);
                self.acls.retain(|(_, object), _| object.database() != name);
                self.objects.retain(|object, _| object.database() != name);
            }
            SqlOperation::DropRole { name } => {
                self.roles.remove(name);
                self.memberships
                    .retain(|m| m.role != *name && m.member != *name);
                self.acls.retain(|(grantee, _), _| grantee != name);
            }
        }
    }
}
