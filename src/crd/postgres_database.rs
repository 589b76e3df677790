//! PostgresDatabase CRD definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ReclaimPolicy, ResourceStatus};

/// PostgresDatabase is the Schema for the postgresdatabases API
///
/// Declares a database, its owning role and its connection limit. The owner
/// must be a role declared by a PostgresRole or already present in PostgreSQL.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresDatabase",
    plural = "postgresdatabases",
    shortname = "pgdb",
    namespaced,
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Database", "type":"string", "jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Owner", "type":"string", "jsonPath":".spec.owner"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDatabaseSpec {
    /// Name of the database in PostgreSQL
    #[schemars(extend("x-kubernetes-validations" = [
        { "rule": "self == oldSelf", "message": "name is immutable" }
    ]))]
    pub name: String,

    /// Role that owns the database
    pub owner: String,

    /// Connection limit for the database (-1 for unlimited)
    #[serde(default = "default_connection_limit")]
    pub connection_limit: i32,

    /// Whether deleting this resource drops the database (default: Retain)
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

fn default_connection_limit() -> i32 {
    -1
}
