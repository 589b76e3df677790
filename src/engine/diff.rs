//! Minimal ordered operation lists
//!
//! Operations are generated per concern and then stably sorted by [`Phase`]:
//! role changes, database changes, privileges, memberships, drops. Objects
//! claimed by another resource are never touched. Teardown is a diff against
//! [`DesiredState::release`].
//!
//! [`Phase`]: super::operation::Phase

use std::collections::BTreeSet;

use super::desired::DesiredState;
use super::object::{Membership, OwnedObject};
use super::operation::{RoleAttributes, SqlOperation};
use super::snapshot::{AclKey, ActualState};

/// Operations that move `actual` to `desired`
pub fn diff(actual: &ActualState, desired: &DesiredState) -> Vec<SqlOperation> {
    let mut ops = Vec::new();
    diff_roles(actual, desired, &mut ops);
    diff_databases(actual, desired, &mut ops);
    diff_privileges(actual, desired, &mut ops);
    diff_memberships(actual, desired, &mut ops);
    diff_drops(actual, desired, &mut ops);
    ops.sort_by_key(SqlOperation::phase);
    ops
}

fn diff_roles(actual: &ActualState, desired: &DesiredState, ops: &mut Vec<SqlOperation>) {
    for role in &desired.roles {
        if desired.is_claimed_by_other(&OwnedObject::Role(role.name.clone())) {
            continue;
        }

        let Some(current) = actual.roles.get(&role.name) else {
            ops.push(SqlOperation::CreateRole {
                name: role.name.clone(),
                attributes: RoleAttributes::for_create(&role.flags),
            });
            for (setting, value) in &role.settings {
                ops.push(SqlOperation::SetRoleConfig {
                    name: role.name.clone(),
                    setting: setting.clone(),
                    value: value.clone(),
                });
            }
            if role.comment.is_some() {
                ops.push(SqlOperation::CommentOnRole {
                    name: role.name.clone(),
                    comment: role.comment.clone(),
                });
            }
            continue;
        };

        let attributes = RoleAttributes::changes(&current.flags, &role.flags);
        if !attributes.is_empty() {
            ops.push(SqlOperation::AlterRole {
                name: role.name.clone(),
                attributes,
            });
        }
        for (setting, value) in &role.settings {
            if current.settings.get(setting) != Some(value) {
                ops.push(SqlOperation::SetRoleConfig {
                    name: role.name.clone(),
                    setting: setting.clone(),
                    value: value.clone(),
                });
            }
        }
        for setting in current.settings.keys() {
            if !role.settings.contains_key(setting) {
                ops.push(SqlOperation::ResetRoleConfig {
                    name: role.name.clone(),
                    setting: setting.clone(),
                });
            }
        }
        if current.comment != role.comment {
            ops.push(SqlOperation::CommentOnRole {
                name: role.name.clone(),
                comment: role.comment.clone(),
            });
        }
    }

    for name in &desired.ensure_roles {
        let declared_here = desired.roles.iter().any(|r| r.name == *name);
        if declared_here
            || actual.has_role(name)
            || desired.is_claimed_by_other(&OwnedObject::Role(name.clone()))
        {
            continue;
        }
        ops.push(SqlOperation::CreateRole {
            name: name.clone(),
            attributes: RoleAttributes::default(),
        });
    }
}

fn diff_databases(actual: &ActualState, desired: &DesiredState, ops: &mut Vec<SqlOperation>) {
    for database in &desired.databases {
        if desired.is_claimed_by_other(&OwnedObject::Database(database.name.clone())) {
            continue;
        }
        match actual.databases.get(&database.name) {
            None => ops.push(SqlOperation::CreateDatabase {
                name: database.name.clone(),
                owner: database.owner.clone(),
                connection_limit: database.connection_limit,
            }),
            Some(current) => {
                if current.owner != database.owner {
                    ops.push(SqlOperation::AlterDatabaseOwner {
                        name: database.name.clone(),
                        owner: database.owner.clone(),
                    });
                }
                if current.connection_limit != database.connection_limit {
                    ops.push(SqlOperation::AlterDatabaseConnectionLimit {
                        name: database.name.clone(),
                        connection_limit: database.connection_limit,
                    });
                }
            }
        }
    }
}

fn diff_privileges(actual: &ActualState, desired: &DesiredState, ops: &mut Vec<SqlOperation>) {
    let mut targeted: BTreeSet<AclKey> = BTreeSet::new();

    for grant in &desired.grants {
        for object in grant.targets(actual) {
            let claim = OwnedObject::acl(grant.grantee.clone(), object.clone());
            if desired.is_claimed_by_other(&claim) {
                continue;
            }
            targeted.insert((grant.grantee.clone(), object.clone()));
            let current = actual.acl(&grant.grantee, &object);

            let missing: BTreeSet<_> = grant
                .privileges
                .iter()
                .filter(|p| match current.and_then(|entry| entry.get(p)) {
                    None => true,
                    Some(grantable) => grant.with_grant_option && !grantable,
                })
                .copied()
                .collect();
            if !missing.is_empty() {
                ops.push(SqlOperation::Grant {
                    object: object.clone(),
                    privileges: missing,
                    grantee: grant.grantee.clone(),
                    with_grant_option: grant.with_grant_option,
                });
            }

            let Some(entry) = current else { continue };
            let extra: BTreeSet<_> = entry
                .keys()
                .filter(|p| !grant.privileges.contains(p))
                .copied()
                .collect();
            if !extra.is_empty() {
                ops.push(SqlOperation::Revoke {
                    object: object.clone(),
                    privileges: extra,
                    grantee: grant.grantee.clone(),
                    grant_option_only: false,
                });
            }
            if !grant.with_grant_option {
                let downgrade: BTreeSet<_> = entry
                    .iter()
                    .filter(|(p, grantable)| **grantable && grant.privileges.contains(p))
                    .map(|(p, _)| *p)
                    .collect();
                if !downgrade.is_empty() {
                    ops.push(SqlOperation::Revoke {
                        object,
                        privileges: downgrade,
                        grantee: grant.grantee.clone(),
                        grant_option_only: true,
                    });
                }
            }
        }
    }

    // Entries applied earlier that the current spec no longer covers
    for owned in &desired.previously_owned {
        let OwnedObject::Acl { grantee, object } = owned else {
            continue;
        };
        if targeted.contains(&(grantee.clone(), object.clone()))
            || desired.is_claimed_by_other(owned)
            || actual.object_owner(object) == Some(grantee.as_str())
        {
            continue;
        }
        if let Some(entry) = actual.acl(grantee, object) {
            ops.push(SqlOperation::Revoke {
                object: object.clone(),
                privileges: entry.keys().copied().collect(),
                grantee: grantee.clone(),
                grant_option_only: false,
            });
        }
    }
}

fn diff_memberships(actual: &ActualState, desired: &DesiredState, ops: &mut Vec<SqlOperation>) {
    for membership in &desired.memberships {
        if actual.memberships.contains(membership)
            || desired.is_claimed_by_other(&OwnedObject::Membership(membership.clone()))
        {
            continue;
        }
        ops.push(SqlOperation::GrantMembership(membership.clone()));
    }

    // memberOf is the complete parent list of a managed role
    let managed_members: BTreeSet<&str> = desired
        .roles
        .iter()
        .filter(|r| !desired.is_claimed_by_other(&OwnedObject::Role(r.name.clone())))
        .map(|r| r.name.as_str())
        .collect();

    for membership in &actual.memberships {
        if desired.memberships.contains(membership) {
            continue;
        }
        let key = OwnedObject::Membership(membership.clone());
        if desired.is_claimed_by_other(&key) {
            continue;
        }
        if managed_members.contains(membership.member.as_str())
            || desired.previously_owned.contains(&key)
        {
            ops.push(SqlOperation::RevokeMembership(membership.clone()));
        }
    }
}

fn diff_drops(actual: &ActualState, desired: &DesiredState, ops: &mut Vec<SqlOperation>) {
    let kept_roles: BTreeSet<&str> = desired
        .roles
        .iter()
        .map(|r| r.name.as_str())
        .chain(desired.ensure_roles.iter().map(String::as_str))
        .collect();
    let kept_databases: BTreeSet<&str> =
        desired.databases.iter().map(|d| d.name.as_str()).collect();

    let mut drop_roles = BTreeSet::new();
    for owned in &desired.previously_owned {
        if desired.is_claimed_by_other(owned) {
            continue;
        }
        match owned {
            OwnedObject::Database(name)
                if desired.reclaim_databases
                    && !kept_databases.contains(name.as_str())
                    && actual.has_database(name) =>
            {
                ops.push(SqlOperation::DropDatabase { name: name.clone() });
            }
            OwnedObject::Role(name)
                if !kept_roles.contains(name.as_str()) && actual.has_role(name) =>
            {
                drop_roles.insert(name.clone());
            }
            _ => {}
        }
    }

    for name in leaf_first(drop_roles, &actual.memberships) {
        ops.push(SqlOperation::DropRole { name });
    }
}

/// Order roles so members are dropped before the roles they belong to
fn leaf_first(mut remaining: BTreeSet<String>, memberships: &BTreeSet<Membership>) -> Vec<String> {
    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|role| {
                !remaining.iter().any(|member| {
                    member != *role
                        && memberships.contains(&Membership::new(role.as_str(), member.as_str()))
                })
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            // Cyclic memberships cannot exist in PostgreSQL; fall back to name order
            ordered.extend(std::mem::take(&mut remaining));
            break;
        }
        for role in ready {
            remaining.remove(&role);
            ordered.push(role);
        }
    }
    ordered
}
