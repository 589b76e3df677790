//! PostgresGrant CRD definition
//!
//! A PostgresGrant declares the privileges one role holds on a database, a
//! schema, or a set of tables or sequences within a schema.

use std::collections::BTreeSet;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::ResourceStatus;

/// PostgresGrant is the Schema for the postgresgrants API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresGrant",
    plural = "postgresgrants",
    shortname = "pggrant",
    namespaced,
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Role", "type":"string", "jsonPath":".spec.role"}"#,
    printcolumn = r#"{"name":"Database", "type":"string", "jsonPath":".spec.database"}"#,
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.objectType"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
#[schemars(extend("x-kubernetes-validations" = [
    { "rule": "has(self.schema) == has(oldSelf.schema)", "message": "schema is immutable" }
]))]
pub struct PostgresGrantSpec {
    /// Role receiving the privileges
    #[schemars(extend("x-kubernetes-validations" = [
        { "rule": "self == oldSelf", "message": "role is immutable" }
    ]))]
    pub role: String,

    /// Database the objects live in
    #[schemars(extend("x-kubernetes-validations" = [
        { "rule": "self == oldSelf", "message": "database is immutable" }
    ]))]
    pub database: String,

    /// Kind of object the privileges apply to
    #[schemars(extend("x-kubernetes-validations" = [
        { "rule": "self == oldSelf", "message": "objectType is immutable" }
    ]))]
    pub object_type: GrantObjectType,

    /// Schema for table, sequence and schema grants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(extend("x-kubernetes-validations" = [
        { "rule": "self == oldSelf", "message": "schema is immutable" }
    ]))]
    pub schema: Option<String>,

    /// Table or sequence names; `*` wildcards are allowed.
    /// Empty means every object of the type in the schema.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<String>,

    /// Privileges to hold
    pub privileges: Vec<Privilege>,

    /// Allow the grantee to grant these privileges to others
    #[serde(default)]
    pub with_grant_option: bool,
}

/// Object kinds a grant can target
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum GrantObjectType {
    Database,
    Schema,
    Table,
    Sequence,
}

impl GrantObjectType {
    /// SQL keyword used in GRANT/REVOKE
    pub fn as_sql(&self) -> &'static str {
        match self {
            GrantObjectType::Database => "DATABASE",
            GrantObjectType::Schema => "SCHEMA",
            GrantObjectType::Table => "TABLE",
            GrantObjectType::Sequence => "SEQUENCE",
        }
    }

    /// Privileges PostgreSQL accepts for this object kind
    pub fn allowed_privileges(&self) -> &'static [Privilege] {
        match self {
            GrantObjectType::Database => &[
                Privilege::Create,
                Privilege::Connect,
                Privilege::Temporary,
            ],
            GrantObjectType::Schema => &[Privilege::Usage, Privilege::Create],
            GrantObjectType::Table => &[
                Privilege::Select,
                Privilege::Insert,
                Privilege::Update,
                Privilege::Delete,
                Privilege::Truncate,
                Privilege::References,
                Privilege::Trigger,
            ],
            GrantObjectType::Sequence => &[Privilege::Usage, Privilege::Select, Privilege::Update],
        }
    }

    /// Lowercase name used in object keys and messages
    pub fn as_key(&self) -> &'static str {
        match self {
            GrantObjectType::Database => "database",
            GrantObjectType::Schema => "schema",
            GrantObjectType::Table => "table",
            GrantObjectType::Sequence => "sequence",
        }
    }

    /// Parse the lowercase key form
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "database" => Some(GrantObjectType::Database),
            "schema" => Some(GrantObjectType::Schema),
            "table" => Some(GrantObjectType::Table),
            "sequence" => Some(GrantObjectType::Sequence),
            _ => None,
        }
    }
}

impl fmt::Display for GrantObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Object privileges
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Privilege {
    Select,
    Insert,
    Update,
    Delete,
    Truncate,
    References,
    Trigger,
    Create,
    Connect,
    Temporary,
    Usage,
}

impl Privilege {
    /// Returns the SQL keyword for this privilege
    pub fn as_sql(&self) -> &'static str {
        match self {
            Privilege::Select => "SELECT",
            Privilege::Insert => "INSERT",
            Privilege::Update => "UPDATE",
            Privilege::Delete => "DELETE",
            Privilege::Truncate => "TRUNCATE",
            Privilege::References => "REFERENCES",
            Privilege::Trigger => "TRIGGER",
            Privilege::Create => "CREATE",
            Privilege::Connect => "CONNECT",
            Privilege::Temporary => "TEMPORARY",
            Privilege::Usage => "USAGE",
        }
    }

    /// Parse the `privilege_type` column returned by `aclexplode`
    pub fn from_sql(value: &str) -> Option<Self> {
        match value {
            "SELECT" => Some(Privilege::Select),
            "INSERT" => Some(Privilege::Insert),
            "UPDATE" => Some(Privilege::Update),
            "DELETE" => Some(Privilege::Delete),
            "TRUNCATE" => Some(Privilege::Truncate),
            "REFERENCES" => Some(Privilege::References),
            "TRIGGER" => Some(Privilege::Trigger),
            "CREATE" => Some(Privilege::Create),
            "CONNECT" => Some(Privilege::Connect),
            "TEMPORARY" | "TEMP" => Some(Privilege::Temporary),
            "USAGE" => Some(Privilege::Usage),
            _ => None,
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl PostgresGrantSpec {
    /// Privileges that are not valid for the declared object type
    pub fn invalid_privileges(&self) -> BTreeSet<Privilege> {
        let allowed = self.object_type.allowed_privileges();
        self.privileges
            .iter()
            .filter(|p| !allowed.contains(p))
            .copied()
            .collect()
    }

    /// Deduplicated privilege set
    pub fn privilege_set(&self) -> BTreeSet<Privilege> {
        self.privileges.iter().copied().collect()
    }
}
