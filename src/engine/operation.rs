//! SQL operations produced by the diff engine

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crd::Privilege;
use crate::postgres::sql::{quote_identifier, quote_literal, setting_value_sql};

use super::object::{Membership, ObjectRef, OwnedObject};

/// Complete set of role attributes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleFlags {
    pub superuser: bool,
    pub login: bool,
    pub createdb: bool,
    pub createrole: bool,
    pub inherit: bool,
    pub replication: bool,
    pub bypassrls: bool,
    pub connection_limit: i32,
    /// Password expiry as Unix seconds; `None` never expires
    pub valid_until: Option<i64>,
}

/// PostgreSQL defaults for `CREATE ROLE` without options
impl Default for RoleFlags {
    fn default() -> Self {
        Self {
            superuser: false,
            login: false,
            createdb: false,
            createrole: false,
            inherit: true,
            replication: false,
            bypassrls: false,
            connection_limit: -1,
            valid_until: None,
        }
    }
}

impl RoleFlags {
    /// Apply the attributes set in `attributes`
    pub fn apply(&mut self, attributes: &RoleAttributes) {
        if let Some(v) = attributes.superuser {
            self.superuser = v;
        }
        if let Some(v) = attributes.login {
            self.login = v;
        }
        if let Some(v) = attributes.createdb {
            self.createdb = v;
        }
        if let Some(v) = attributes.createrole {
            self.createrole = v;
        }
        if let Some(v) = attributes.inherit {
            self.inherit = v;
        }
        if let Some(v) = attributes.replication {
            self.replication = v;
        }
        if let Some(v) = attributes.bypassrls {
            self.bypassrls = v;
        }
        if let Some(v) = attributes.connection_limit {
            self.connection_limit = v;
        }
        if let Some(v) = attributes.valid_until {
            self.valid_until = v;
        }
    }
}

/// Role attributes to set; `None` leaves an attribute unchanged
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleAttributes {
    pub superuser: Option<bool>,
    pub login: Option<bool>,
    pub createdb: Option<bool>,
    pub createrole: Option<bool>,
    pub inherit: Option<bool>,
    pub replication: Option<bool>,
    pub bypassrls: Option<bool>,
    pub connection_limit: Option<i32>,
    /// `Some(None)` clears the expiry
    pub valid_until: Option<Option<i64>>,
}

fn changed<T: PartialEq + Copy>(from: T, to: T) -> Option<T> {
    (from != to).then_some(to)
}

impl RoleAttributes {
    /// Attributes that differ from PostgreSQL's `CREATE ROLE` defaults
    pub fn for_create(flags: &RoleFlags) -> Self {
        Self::changes(&RoleFlags::default(), flags)
    }

    /// Attributes needed to turn `from` into `to`
    pub fn changes(from: &RoleFlags, to: &RoleFlags) -> Self {
        Self {
            superuser: changed(from.superuser, to.superuser),
            login: changed(from.login, to.login),
            createdb: changed(from.createdb, to.createdb),
            createrole: changed(from.createrole, to.createrole),
            inherit: changed(from.inherit, to.inherit),
            replication: changed(from.replication, to.replication),
            bypassrls: changed(from.bypassrls, to.bypassrls),
            connection_limit: changed(from.connection_limit, to.connection_limit),
            valid_until: changed(from.valid_until, to.valid_until),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Option list such as ` WITH LOGIN NOSUPERUSER CONNECTION LIMIT 5`
    fn to_sql(&self) -> String {
        let flag = |value: Option<bool>, on: &'static str, off: &'static str| {
            value.map(|v| if v { on } else { off })
        };
        let mut options: Vec<String> = [
            flag(self.superuser, "SUPERUSER", "NOSUPERUSER"),
            flag(self.login, "LOGIN", "NOLOGIN"),
            flag(self.createdb, "CREATEDB", "NOCREATEDB"),
            flag(self.createrole, "CREATEROLE", "NOCREATEROLE"),
            flag(self.inherit, "INHERIT", "NOINHERIT"),
            flag(self.replication, "REPLICATION", "NOREPLICATION"),
            flag(self.bypassrls, "BYPASSRLS", "NOBYPASSRLS"),
        ]
        .into_iter()
        .flatten()
        .map(str::to_string)
        .collect();
        if let Some(limit) = self.connection_limit {
            options.push(format!("CONNECTION LIMIT {}", limit));
        }
        if let Some(valid_until) = self.valid_until {
            let at = valid_until
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_else(|| "infinity".to_string());
            options.push(format!("VALID UNTIL {}", quote_literal(&at)));
        }

        if options.is_empty() {
            String::new()
        } else {
            format!(" WITH {}", options.join(" "))
        }
    }
}

/// Execution phase; operations run in phase order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Role creation and role attribute changes
    Role,
    /// Database creation and database attribute changes
    Database,
    /// Object privilege grants and revokes
    Privilege,
    /// Role membership grants and revokes
    Membership,
    /// Drops, leaf objects first
    Drop,
}

/// One SQL statement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqlOperation {
    CreateRole {
        name: String,
        attributes: RoleAttributes,
    },
    AlterRole {
        name: String,
        attributes: RoleAttributes,
    },
    SetRoleConfig {
        name: String,
        setting: String,
        value: String,
    },
    ResetRoleConfig {
        name: String,
        setting: String,
    },
    CommentOnRole {
        name: String,
        comment: Option<String>,
    },
    /// Set a precomputed password verifier; the plaintext never reaches SQL
    SetPassword {
        name: String,
        verifier: String,
    },
    CreateDatabase {
        name: String,
        owner: String,
        connection_limit: i32,
    },
    AlterDatabaseOwner {
        name: String,
        owner: String,
    },
    AlterDatabaseConnectionLimit {
        name: String,
        connection_limit: i32,
    },
    Grant {
        object: ObjectRef,
        privileges: BTreeSet<Privilege>,
        grantee: String,
        with_grant_option: bool,
    },
    Revoke {
        object: ObjectRef,
        privileges: BTreeSet<Privilege>,
        grantee: String,
        /// Only remove the ability to re-grant
        grant_option_only: bool,
    },
    GrantMembership(Membership),
    RevokeMembership(Membership),
    DropDatabase {
        name: String,
    },
    DropRole {
        name: String,
    },
}

fn privilege_list(privileges: &BTreeSet<Privilege>) -> String {
    privileges
        .iter()
        .map(Privilege::as_sql)
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqlOperation {
    /// Statement text sent to PostgreSQL
    pub fn to_sql(&self) -> String {
        match self {
            SqlOperation::CreateRole { name, attributes } => {
                format!("CREATE ROLE {}{}", quote_identifier(name), attributes.to_sql())
            }
            SqlOperation::AlterRole { name, attributes } => {
                format!("ALTER ROLE {}{}", quote_identifier(name), attributes.to_sql())
            }
            SqlOperation::SetRoleConfig {
                name,
                setting,
                value,
            } => format!(
                "ALTER ROLE {} SET {} = {}",
                quote_identifier(name),
                setting,
                setting_value_sql(setting, value)
            ),
            SqlOperation::ResetRoleConfig { name, setting } => {
                format!("ALTER ROLE {} RESET {}", quote_identifier(name), setting)
            }
            SqlOperation::CommentOnRole { name, comment } => format!(
                "COMMENT ON ROLE {} IS {}",
                quote_identifier(name),
                comment
                    .as_deref()
                    .map(quote_literal)
                    .unwrap_or_else(|| "NULL".to_string())
            ),
            SqlOperation::SetPassword { name, verifier } => format!(
                "ALTER ROLE {} PASSWORD {}",
                quote_identifier(name),
                quote_literal(verifier)
            ),
            SqlOperation::CreateDatabase {
                name,
                owner,
                connection_limit,
            } => format!(
                "CREATE DATABASE {} OWNER {} CONNECTION LIMIT {}",
                quote_identifier(name),
                quote_identifier(owner),
                connection_limit
            ),
            SqlOperation::AlterDatabaseOwner { name, owner } => format!(
                "ALTER DATABASE {} OWNER TO {}",
                quote_identifier(name),
                quote_identifier(owner)
            ),
            SqlOperation::AlterDatabaseConnectionLimit {
                name,
                connection_limit,
            } => format!(
                "ALTER DATABASE {} CONNECTION LIMIT {}",
                quote_identifier(name),
                connection_limit
            ),
            SqlOperation::Grant {
                object,
                privileges,
                grantee,
                with_grant_option,
            } => format!(
                "GRANT {} ON {} TO {}{}",
                privilege_list(privileges),
                object.to_sql(),
                quote_identifier(grantee),
                if *with_grant_option {
                    " WITH GRANT OPTION"
                } else {
                    ""
                }
            ),
            SqlOperation::Revoke {
                object,
                privileges,
                grantee,
                grant_option_only,
            } => format!(
                "REVOKE {}{} ON {} FROM {}",
                if *grant_option_only {
                    "GRANT OPTION FOR "
                } else {
                    ""
                },
                privilege_list(privileges),
                object.to_sql(),
                quote_identifier(grantee)
            ),
            SqlOperation::GrantMembership(m) => format!(
                "GRANT {} TO {}",
                quote_identifier(&m.role),
                quote_identifier(&m.member)
            ),
            SqlOperation::RevokeMembership(m) => format!(
                "REVOKE {} FROM {}",
                quote_identifier(&m.role),
                quote_identifier(&m.member)
            ),
            SqlOperation::DropDatabase { name } => {
                format!("DROP DATABASE {}", quote_identifier(name))
            }
            SqlOperation::DropRole { name } => format!("DROP ROLE {}", quote_identifier(name)),
        }
    }

    /// Statement text safe for logs and status messages
    pub fn redacted(&self) -> String {
        match self {
            SqlOperation::SetPassword { name, .. } => {
                format!("ALTER ROLE {} PASSWORD '<redacted>'", quote_identifier(name))
            }
            other => other.to_sql(),
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            SqlOperation::CreateRole { .. }
            | SqlOperation::AlterRole { .. }
            | SqlOperation::SetRoleConfig { .. }
            | SqlOperation::ResetRoleConfig { .. }
            | SqlOperation::CommentOnRole { .. }
            | SqlOperation::SetPassword { .. } => Phase::Role,
            SqlOperation::CreateDatabase { .. }
            | SqlOperation::AlterDatabaseOwner { .. }
            | SqlOperation::AlterDatabaseConnectionLimit { .. } => Phase::Database,
            SqlOperation::Grant { .. } | SqlOperation::Revoke { .. } => Phase::Privilege,
            SqlOperation::GrantMembership(_) | SqlOperation::RevokeMembership(_) => {
                Phase::Membership
            }
            SqlOperation::DropDatabase { .. } | SqlOperation::DropRole { .. } => Phase::Drop,
        }
    }

    /// Whether the statement may run inside a transaction block
    pub fn is_transactional(&self) -> bool {
        !matches!(
            self,
            SqlOperation::CreateDatabase { .. } | SqlOperation::DropDatabase { .. }
        )
    }

    /// Object the statement modifies
    pub fn target(&self) -> OwnedObject {
        match self {
            SqlOperation::CreateRole { name, .. }
            | SqlOperation::AlterRole { name, .. }
            | SqlOperation::SetRoleConfig { name, .. }
            | SqlOperation::ResetRoleConfig { name, .. }
            | SqlOperation::CommentOnRole { name, .. }
            | SqlOperation::SetPassword { name, .. }
            | SqlOperation::DropRole { name } => OwnedObject::Role(name.clone()),
            SqlOperation::CreateDatabase { name, .. }
            | SqlOperation::AlterDatabaseOwner { name, .. }
            | SqlOperation::AlterDatabaseConnectionLimit { name, .. }
            | SqlOperation::DropDatabase { name } => OwnedObject::Database(name.clone()),
            SqlOperation::Grant {
                object, grantee, ..
            }
            | SqlOperation::Revoke {
                object, grantee, ..
            } => OwnedObject::acl(grantee.clone(), object.clone()),
            SqlOperation::GrantMembership(m) | SqlOperation::RevokeMembership(m) => {
                OwnedObject::Membership(m.clone())
            }
        }
    }
}

impl fmt::Display for SqlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}
