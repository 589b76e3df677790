//! PostgresRole CRD definition
//!
//! A PostgresRole declares a single PostgreSQL role: its attributes, the roles
//! it is a member of, and optionally a Secret that holds its password.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ResourceStatus, SecretRef, parse_duration};

/// PostgresRole is the Schema for the postgresroles API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresRole",
    plural = "postgresroles",
    shortname = "pgrole",
    namespaced,
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Role", "type":"string", "jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Login", "type":"boolean", "jsonPath":".spec.login"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresRoleSpec {
    /// Name of the role in PostgreSQL
    #[schemars(extend("x-kubernetes-validations" = [
        { "rule": "self == oldSelf", "message": "name is immutable" }
    ]))]
    pub name: String,

    /// Role can log in
    #[serde(default)]
    pub login: bool,

    /// Role bypasses all permission checks
    #[serde(default)]
    pub superuser: bool,

    /// Role can create databases
    #[serde(default)]
    pub createdb: bool,

    /// Role can create other roles
    #[serde(default)]
    pub createrole: bool,

    /// Role inherits the privileges of roles it is a member of
    #[serde(default = "default_inherit")]
    pub inherit: bool,

    /// Role can initiate streaming replication
    #[serde(default)]
    pub replication: bool,

    /// Role bypasses row-level security policies
    #[serde(default)]
    pub bypassrls: bool,

    /// Maximum concurrent connections (-1 for unlimited)
    #[serde(default = "default_connection_limit")]
    pub connection_limit: i32,

    /// Password expiry as an RFC 3339 timestamp; unset never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<String>,

    /// Roles this role is a member of
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub member_of: Vec<String>,

    /// Secret holding (or receiving) the role password
    ///
    /// The Secret contains `username` and `password` keys. It is created with a
    /// generated password when it does not exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret_ref: Option<SecretRef>,

    /// Regenerate the password after this interval (e.g. "30d", "12h")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_rotation: Option<String>,

    /// Comment stored on the role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Role-level configuration parameters (ALTER ROLE ... SET)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

fn default_inherit() -> bool {
    true
}

fn default_connection_limit() -> i32 {
    -1
}

impl PostgresRoleSpec {
    /// Parsed password rotation interval
    ///
    /// Returns `Err` with the offending value when it cannot be parsed.
    pub fn rotation_interval(&self) -> Result<Option<Duration>, String> {
        match &self.password_rotation {
            None => Ok(None),
            Some(raw) => parse_duration(raw).map(Some).ok_or_else(|| raw.clone()),
        }
    }

    /// Password expiry as Unix seconds, truncated to whole seconds
    ///
    /// Returns `Err` with the offending value when it is not RFC 3339.
    pub fn valid_until_secs(&self) -> Result<Option<i64>, String> {
        match &self.valid_until {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|at| Some(at.timestamp()))
                .map_err(|_| raw.clone()),
        }
    }
}

impl PostgresRole {
    /// Whether this role reads its password from the given Secret
    pub fn uses_secret(&self, namespace: &str, name: &str) -> bool {
        let own_ns = self.metadata.namespace.as_deref().unwrap_or_default();
        self.spec
            .password_secret_ref
            .as_ref()
            .is_some_and(|r| r.name == name && r.namespace_or(own_ns) == namespace)
    }
}
