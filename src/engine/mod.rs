//! Desired-state resolution and diffing
//!
//! Everything here is pure apart from [`read_actual_state`], which only talks
//! to PostgreSQL through the [`CatalogQuery`](crate::postgres::catalog::CatalogQuery) trait.

mod desired;
mod diff;
mod object;
mod operation;
mod resolve;
mod snapshot;

pub use desired::{
    DesiredCredential, DesiredDatabase, DesiredGrant, DesiredRole, DesiredState, ExternalRef,
    ObjectSelector,
};
pub use diff::diff;
pub use object::{Membership, ObjectRef, OwnedObject, ParseKeyError};
pub use operation::{Phase, RoleAttributes, RoleFlags, SqlOperation};
pub use resolve::{foreign_claims, membership_cycle, resolve, ResolveError};
pub use snapshot::{
    read_actual_state, AclEntry, AclKey, ActualState, DatabaseState, ReadScope, RoleState,
};
