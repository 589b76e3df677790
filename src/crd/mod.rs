mod common;
mod managed;
mod postgres_database;
mod postgres_grant;
mod postgres_role;

pub use common::*;
pub use managed::*;
pub use postgres_database::*;
pub use postgres_grant::*;
pub use postgres_role::*;
