//! Desired-state resolution
//!
//! Turns one resource's spec plus every other visible resource into a
//! [`DesiredState`]. Resolution is pure: references to roles and databases
//! declared by other resources resolve here, references to anything else are
//! recorded as external and checked against the catalog snapshot before any
//! write.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use thiserror::Error;

use crate::crd::{
    GrantObjectType, ManagedResource, PostgresDatabase, PostgresGrant, PostgresRole,
    ReclaimPolicy, RelatedResources, ResourceKey,
};
use crate::postgres::sql::{is_valid_identifier, is_valid_setting_name, normalize_setting_value};

use super::desired::{
    DesiredCredential, DesiredDatabase, DesiredGrant, DesiredRole, DesiredState, ExternalRef,
    ObjectSelector,
};
use super::object::{Membership, ObjectRef, OwnedObject};
use super::operation::RoleFlags;

/// Why a resource could not be resolved
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// A referenced role, database or object does not exist yet
    #[error("Unresolved dependency: {missing_ref}")]
    Unresolved { missing_ref: String },

    /// The spec can never be applied as written
    #[error("Invalid spec: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ResolveError {
    ResolveError::Invalid(message.into())
}

fn check_identifier(field: &str, value: &str) -> Result<(), ResolveError> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(invalid(format!(
            "{} {:?} is not a valid identifier (1-63 bytes, no NUL)",
            field, value
        )))
    }
}

fn check_connection_limit(limit: i32) -> Result<(), ResolveError> {
    if limit < -1 {
        return Err(invalid(format!(
            "connectionLimit must be -1 or greater, got {}",
            limit
        )));
    }
    Ok(())
}

/// Resolve `resource` against every resource in `related`
pub fn resolve(
    resource: &ManagedResource,
    related: &RelatedResources,
) -> Result<DesiredState, ResolveError> {
    let key = resource.key();
    let mut desired = DesiredState::new(key.clone());

    desired.previously_owned = resource
        .owned_objects()
        .iter()
        .filter_map(|k| k.parse::<OwnedObject>().ok())
        .collect();
    desired.foreign_claims = foreign_claims(&key, related);

    match resource {
        ManagedResource::Role(role) => resolve_role(role, related, &mut desired)?,
        ManagedResource::Database(database) => {
            resolve_database(database, related, &mut desired)?
        }
        ManagedResource::Grant(grant) => resolve_grant(grant, related, &mut desired)?,
    }
    Ok(desired)
}

/// Claims recorded by every resource other than `key`
pub fn foreign_claims(
    key: &ResourceKey,
    related: &RelatedResources,
) -> BTreeMap<OwnedObject, ResourceKey> {
    let mut claims = BTreeMap::new();
    for other in related.others(key) {
        let owner = other.key();
        for object in other.owned_objects() {
            if let Ok(object) = object.parse::<OwnedObject>() {
                claims.entry(object).or_insert_with(|| owner.clone());
            }
        }
    }
    claims
}

/// Whether a live resource other than `key` declares the role
fn role_declared(related: &RelatedResources, name: &str, key: &ResourceKey) -> bool {
    related
        .roles_named(name, key)
        .any(|r| r.metadata.deletion_timestamp.is_none())
}

fn database_declared(related: &RelatedResources, name: &str, key: &ResourceKey) -> bool {
    related
        .databases_named(name, key)
        .any(|d| d.metadata.deletion_timestamp.is_none())
}

/// Require `name` to exist: created bare when another resource declares it,
/// otherwise it must already be in the catalog
fn require_role(desired: &mut DesiredState, related: &RelatedResources, name: &str) {
    if role_declared(related, name, &desired.key) {
        desired.ensure_roles.insert(name.to_string());
    } else {
        desired.external_refs.insert(ExternalRef::Role(name.to_string()));
    }
}

fn resolve_role(
    role: &PostgresRole,
    related: &RelatedResources,
    desired: &mut DesiredState,
) -> Result<(), ResolveError> {
    let spec = &role.spec;
    check_identifier("name", &spec.name)?;
    check_connection_limit(spec.connection_limit)?;

    let mut parents = BTreeSet::new();
    for parent in &spec.member_of {
        check_identifier("memberOf", parent)?;
        if *parent == spec.name {
            return Err(invalid(format!("role {} cannot be a member of itself", spec.name)));
        }
        parents.insert(parent.clone());
    }

    let mut settings = BTreeMap::new();
    for (name, value) in &spec.settings {
        if !is_valid_setting_name(name) {
            return Err(invalid(format!("invalid setting name {:?}", name)));
        }
        let name = name.to_ascii_lowercase();
        let value = normalize_setting_value(&name, value);
        settings.insert(name, value);
    }

    let valid_until = spec
        .valid_until_secs()
        .map_err(|raw| invalid(format!("invalid validUntil {:?}, expected RFC 3339", raw)))?;

    let rotation = spec
        .rotation_interval()
        .map_err(|raw| invalid(format!("invalid passwordRotation {:?}", raw)))?;
    if rotation.is_some() && spec.password_secret_ref.is_none() {
        return Err(invalid("passwordRotation requires passwordSecretRef"));
    }

    if let Some(cycle) = membership_cycle(role, related) {
        return Err(invalid(format!(
            "role membership cycle: {}",
            cycle.join(" -> ")
        )));
    }

    let own_namespace = role.namespace().unwrap_or_default();
    if let Some(secret) = &spec.password_secret_ref {
        if secret.name.is_empty() {
            return Err(invalid("passwordSecretRef.name must not be empty"));
        }
        desired.credential = Some(DesiredCredential {
            role: spec.name.clone(),
            secret_namespace: secret.namespace_or(&own_namespace).to_string(),
            secret_name: secret.name.clone(),
            rotation,
        });
    }

    for parent in &parents {
        require_role(desired, related, parent);
        desired
            .memberships
            .insert(Membership::new(parent.as_str(), spec.name.as_str()));
    }

    desired.roles.push(DesiredRole {
        name: spec.name.clone(),
        flags: RoleFlags {
            superuser: spec.superuser,
            login: spec.login,
            createdb: spec.createdb,
            createrole: spec.createrole,
            inherit: spec.inherit,
            replication: spec.replication,
            bypassrls: spec.bypassrls,
            connection_limit: spec.connection_limit,
            valid_until,
        },
        comment: spec.comment.clone().filter(|c| !c.is_empty()),
        settings,
    });
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Find a membership cycle reachable from `role`
///
/// The graph is built from every live PostgresRole, with `role`'s own spec
/// taking the place of its stored copy. Returns the cycle path, first node
/// repeated at the end.
pub fn membership_cycle(role: &PostgresRole, related: &RelatedResources) -> Option<Vec<String>> {
    let own_name = role.name_any();
    let own_namespace = role.namespace();
    let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for other in &related.roles {
        if other.metadata.deletion_timestamp.is_some()
            || (other.name_any() == own_name && other.namespace() == own_namespace)
        {
            continue;
        }
        let parents = edges.entry(other.spec.name.as_str()).or_default();
        parents.extend(other.spec.member_of.iter().map(String::as_str));
    }
    edges
        .entry(role.spec.name.as_str())
        .or_default()
        .extend(role.spec.member_of.iter().map(String::as_str));

    let mut colors: BTreeMap<&str, Color> = BTreeMap::new();
    let mut path = Vec::new();
    visit(role.spec.name.as_str(), &edges, &mut colors, &mut path)
}

fn visit<'a>(
    node: &'a str,
    edges: &BTreeMap<&'a str, BTreeSet<&'a str>>,
    colors: &mut BTreeMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match colors.get(node).copied().unwrap_or(Color::White) {
        Color::Black => return None,
        Color::Gray => {
            let start = path.iter().position(|n| *n == node).unwrap_or(0);
            let mut cycle: Vec<String> = path
                .iter()
                .skip(start)
                .map(|n| n.to_string())
                .collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        Color::White => {}
    }

    colors.insert(node, Color::Gray);
    path.push(node);
    if let Some(parents) = edges.get(node) {
        for parent in parents {
            if let Some(cycle) = visit(parent, edges, colors, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    colors.insert(node, Color::Black);
    None
}

fn resolve_database(
    database: &PostgresDatabase,
    related: &RelatedResources,
    desired: &mut DesiredState,
) -> Result<(), ResolveError> {
    let spec = &database.spec;
    check_identifier("name", &spec.name)?;
    check_identifier("owner", &spec.owner)?;
    check_connection_limit(spec.connection_limit)?;

    require_role(desired, related, &spec.owner);
    desired.databases.push(DesiredDatabase {
        name: spec.name.clone(),
        owner: spec.owner.clone(),
        connection_limit: spec.connection_limit,
    });
    desired.reclaim_databases = spec.reclaim_policy == ReclaimPolicy::Delete;
    Ok(())
}

fn resolve_grant(
    grant: &PostgresGrant,
    related: &RelatedResources,
    desired: &mut DesiredState,
) -> Result<(), ResolveError> {
    let spec = &grant.spec;
    check_identifier("role", &spec.role)?;
    check_identifier("database", &spec.database)?;

    if spec.privileges.is_empty() {
        return Err(invalid("privileges must not be empty"));
    }
    let not_allowed = spec.invalid_privileges();
    if !not_allowed.is_empty() {
        let names: Vec<&str> = not_allowed.iter().map(|p| p.as_sql()).collect();
        return Err(invalid(format!(
            "privileges {} are not valid for object type {}",
            names.join(", "),
            spec.object_type
        )));
    }

    let schema = match (spec.object_type, spec.schema.as_deref()) {
        (GrantObjectType::Database, None) => None,
        (GrantObjectType::Database, Some(_)) => {
            return Err(invalid("schema must not be set for database grants"));
        }
        (_, None) => {
            return Err(invalid(format!(
                "schema is required for {} grants",
                spec.object_type
            )));
        }
        (_, Some(schema)) => {
            check_identifier("schema", schema)?;
            Some(schema.to_string())
        }
    };

    let selector = match spec.object_type {
        GrantObjectType::Database | GrantObjectType::Schema => {
            if !spec.objects.is_empty() {
                return Err(invalid(format!(
                    "objects must not be set for {} grants",
                    spec.object_type
                )));
            }
            ObjectSelector::All
        }
        GrantObjectType::Table | GrantObjectType::Sequence => {
            for object in &spec.objects {
                if !is_valid_identifier(object) {
                    return Err(invalid(format!("invalid object name {:?}", object)));
                }
            }
            if spec.objects.is_empty() {
                ObjectSelector::All
            } else {
                ObjectSelector::Patterns(spec.objects.clone())
            }
        }
    };

    require_role(desired, related, &spec.role);
    if !database_declared(related, &spec.database, &desired.key) {
        desired
            .external_refs
            .insert(ExternalRef::Database(spec.database.clone()));
    }

    if let Some(schema) = &schema {
        desired.external_refs.insert(ExternalRef::Object(ObjectRef::new(
            GrantObjectType::Schema,
            &spec.database,
            schema,
            "",
        )));
        desired.scope.schemas.insert(schema.clone());

        for object in spec.objects.iter().filter(|o| !o.contains('*')) {
            desired.external_refs.insert(ExternalRef::Object(ObjectRef::new(
                spec.object_type,
                &spec.database,
                schema,
                object,
            )));
        }
    }

    // Entries applied under an earlier schema are read so they can be revoked
    let earlier_schemas: Vec<String> = desired
        .previously_owned
        .iter()
        .filter_map(|owned| match owned {
            OwnedObject::Acl { object, .. }
                if object.database() == spec.database && !object.schema().is_empty() =>
            {
                Some(object.schema().to_string())
            }
            _ => None,
        })
        .collect();
    desired.scope.schemas.extend(earlier_schemas);

    desired.grants.push(DesiredGrant {
        grantee: spec.role.clone(),
        database: spec.database.clone(),
        object_type: spec.object_type,
        schema,
        selector,
        privileges: spec.privilege_set(),
        with_grant_option: spec.with_grant_option,
    });
    Ok(())
}
