//! Stable identifiers for PostgreSQL objects and ownership claims

use std::fmt;
use std::str::FromStr;

use crate::crd::GrantObjectType;
use crate::postgres::sql::quote_identifier;

/// An object privileges can be granted on
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectRef {
    Database {
        name: String,
    },
    Schema {
        database: String,
        name: String,
    },
    Table {
        database: String,
        schema: String,
        name: String,
    },
    Sequence {
        database: String,
        schema: String,
        name: String,
    },
}

impl ObjectRef {
    /// Build a reference from its parts; `schema` and `name` are ignored where
    /// the object type does not use them
    pub fn new(object_type: GrantObjectType, database: &str, schema: &str, name: &str) -> Self {
        match object_type {
            GrantObjectType::Database => ObjectRef::Database {
                name: database.to_string(),
            },
            GrantObjectType::Schema => ObjectRef::Schema {
                database: database.to_string(),
                name: schema.to_string(),
            },
            GrantObjectType::Table => ObjectRef::Table {
                database: database.to_string(),
                schema: schema.to_string(),
                name: name.to_string(),
            },
            GrantObjectType::Sequence => ObjectRef::Sequence {
                database: database.to_string(),
                schema: schema.to_string(),
                name: name.to_string(),
            },
        }
    }

    pub fn object_type(&self) -> GrantObjectType {
        match self {
            ObjectRef::Database { .. } => GrantObjectType::Database,
            ObjectRef::Schema { .. } => GrantObjectType::Schema,
            ObjectRef::Table { .. } => GrantObjectType::Table,
            ObjectRef::Sequence { .. } => GrantObjectType::Sequence,
        }
    }

    /// Database the object lives in (the database itself for database refs)
    pub fn database(&self) -> &str {
        match self {
            ObjectRef::Database { name } => name,
            ObjectRef::Schema { database, .. }
            | ObjectRef::Table { database, .. }
            | ObjectRef::Sequence { database, .. } => database,
        }
    }

    /// Schema part; empty for databases
    pub fn schema(&self) -> &str {
        match self {
            ObjectRef::Database { .. } => "",
            ObjectRef::Schema { name, .. } => name,
            ObjectRef::Table { schema, .. } | ObjectRef::Sequence { schema, .. } => schema,
        }
    }

    /// Relation name; empty for databases and schemas
    pub fn relation(&self) -> &str {
        match self {
            ObjectRef::Database { .. } | ObjectRef::Schema { .. } => "",
            ObjectRef::Table { name, .. } | ObjectRef::Sequence { name, .. } => name,
        }
    }

    /// Object clause for GRANT/REVOKE, e.g. `TABLE "public"."orders"`
    pub fn to_sql(&self) -> String {
        match self {
            ObjectRef::Database { name } => format!("DATABASE {}", quote_identifier(name)),
            ObjectRef::Schema { name, .. } => format!("SCHEMA {}", quote_identifier(name)),
            ObjectRef::Table { schema, name, .. } | ObjectRef::Sequence { schema, name, .. } => {
                format!(
                    "{} {}.{}",
                    self.object_type().as_sql(),
                    quote_identifier(schema),
                    quote_identifier(name)
                )
            }
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Database { name } => write!(f, "database {}", name),
            ObjectRef::Schema { database, name } => write!(f, "schema {}.{}", database, name),
            ObjectRef::Table {
                database,
                schema,
                name,
            } => write!(f, "table {}.{}.{}", database, schema, name),
            ObjectRef::Sequence {
                database,
                schema,
                name,
            } => write!(f, "sequence {}.{}.{}", database, schema, name),
        }
    }
}

/// `member` is a member of `role` (`GRANT role TO member`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Membership {
    pub role: String,
    pub member: String,
}

impl Membership {
    pub fn new(role: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            member: member.into(),
        }
    }
}

/// A PostgreSQL object a resource claims through `status.ownedObjects`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OwnedObject {
    Role(String),
    Database(String),
    Membership(Membership),
    /// Every privilege `grantee` holds on `object`
    Acl { grantee: String, object: ObjectRef },
}

impl OwnedObject {
    pub fn acl(grantee: impl Into<String>, object: ObjectRef) -> Self {
        OwnedObject::Acl {
            grantee: grantee.into(),
            object,
        }
    }
}

/// Error parsing an owned object key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid owned object key: {0}")]
pub struct ParseKeyError(pub String);

fn escape(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}

fn unescape(segment: &str) -> String {
    segment.replace("%2F", "/").replace("%25", "%")
}

impl fmt::Display for OwnedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnedObject::Role(name) => write!(f, "role:{}", escape(name)),
            OwnedObject::Database(name) => write!(f, "database:{}", escape(name)),
            OwnedObject::Membership(m) => {
                write!(f, "membership:{}/{}", escape(&m.role), escape(&m.member))
            }
            OwnedObject::Acl { grantee, object } => write!(
                f,
                "acl:{}/{}/{}/{}/{}",
                escape(object.database()),
                object.object_type().as_key(),
                escape(object.schema()),
                escape(object.relation()),
                escape(grantee)
            ),
        }
    }
}

impl FromStr for OwnedObject {
    type Err = ParseKeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseKeyError(key.to_string());
        let (kind, rest) = key.split_once(':').ok_or_else(invalid)?;
        let parts: Vec<String> = rest.split('/').map(unescape).collect();

        match (kind, parts.as_slice()) {
            ("role", [name]) if !name.is_empty() => Ok(OwnedObject::Role(name.clone())),
            ("database", [name]) if !name.is_empty() => Ok(OwnedObject::Database(name.clone())),
            ("membership", [role, member]) => Ok(OwnedObject::Membership(Membership::new(
                role.as_str(),
                member.as_str(),
            ))),
            ("acl", [database, object_type, schema, relation, grantee]) => {
                let object_type = GrantObjectType::from_key(object_type).ok_or_else(invalid)?;
                Ok(OwnedObject::Acl {
                    grantee: grantee.clone(),
                    object: ObjectRef::new(object_type, database, schema, relation),
                })
            }
            _ => Err(invalid()),
        }
    }
}
