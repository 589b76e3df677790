//! End-to-end reconciliation against a live PostgreSQL server

use postgres_access_operator::controller::CycleReport;
use postgres_access_operator::credentials::password_matches;
use postgres_access_operator::crd::{GrantObjectType, Privilege, ResourceStatus};
use postgres_access_operator::engine::ObjectRef;
use postgres_access_operator::postgres::sql::quote_identifier;

use crate::common::*;
use crate::postgres::*;

fn owned_status(report: &CycleReport) -> ResourceStatus {
    let owned: Vec<&str> = report.owned_objects.iter().map(String::as_str).collect();
    status_owning(&owned)
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_catalog_snapshot_sees_admin() {
    let pools = registry();
    let maintenance = pools.maintenance_database().to_string();
    let state = snapshot(&pools, &maintenance, &[]).await;

    assert!(state.has_database(&maintenance));
    assert!(state.roles.values().any(|r| r.flags.superuser));
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_role_converges_and_is_stable() {
    let pools = registry();
    let role = unique("role");
    let world = World::new().role(
        RoleBuilder::new("app", "it")
            .role_name(&role)
            .login()
            .connection_limit(3)
            .setting("work_mem", "64MB")
            .comment("integration test role")
            .build(),
    );
    let secrets = MemorySecretStore::default();

    let report = reconcile(&pools, &world, &secrets, "PostgresRole", "app")
        .await
        .unwrap();
    assert!(report.applied >= 1);
    assert_eq!(report.owned_objects, vec![format!("role:{}", role)]);

    let state = snapshot(&pools, pools.maintenance_database(), &[]).await;
    let actual = &state.roles[&role];
    assert!(actual.flags.login);
    assert_eq!(actual.flags.connection_limit, 3);
    assert_eq!(actual.settings.get("work_mem").map(String::as_str), Some("64MB"));
    assert_eq!(actual.comment.as_deref(), Some("integration test role"));

    let again = reconcile(&pools, &world, &secrets, "PostgresRole", "app")
        .await
        .unwrap();
    assert_eq!(again.applied, 0);

    cleanup(&pools, &[], &[&role]).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_password_written_as_scram() {
    let pools = registry();
    let role = unique("login");
    let world = World::new().role(
        RoleBuilder::new("app", "it")
            .role_name(&role)
            .login()
            .password_secret("app-credentials")
            .build(),
    );
    let secrets = MemorySecretStore::default();

    let report = reconcile(&pools, &world, &secrets, "PostgresRole", "app")
        .await
        .unwrap();
    assert!(report.credential.is_some());

    let password = secrets.password("it", "app-credentials").unwrap();
    let state = snapshot(&pools, pools.maintenance_database(), &[]).await;
    let verifier = state.roles[&role].password.clone();
    assert!(verifier.as_deref().is_some_and(|v| v.starts_with("SCRAM-SHA-256$")));
    assert!(password_matches(verifier.as_deref(), &role, &password));

    cleanup(&pools, &[], &[&role]).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_database_grants_and_teardown() {
    let pools = registry();
    let owner = unique("owner");
    let reader = unique("reader");
    let database = unique("db");

    let mut world = World::new()
        .role(RoleBuilder::new("owner", "it").role_name(&owner).build())
        .role(RoleBuilder::new("reader", "it").role_name(&reader).login().build())
        .database(
            DatabaseBuilder::new("db", "it", &owner)
                .database_name(&database)
                .reclaim_delete()
                .build(),
        )
        .grant(
            GrantBuilder::database("connect", "it", &reader, &database)
                .privileges(&[Privilege::Connect])
                .build(),
        )
        .grant(
            GrantBuilder::table("read", "it", &reader, &database, "public")
                .privileges(&[Privilege::Select])
                .build(),
        );
    let secrets = MemorySecretStore::default();

    for (kind, name) in [
        ("PostgresRole", "owner"),
        ("PostgresRole", "reader"),
        ("PostgresDatabase", "db"),
    ] {
        let report = reconcile(&pools, &world, &secrets, kind, name)
            .await
            .unwrap_or_else(|f| panic!("{} {}: {}", kind, name, f.error));
        world.set_status(kind, name, owned_status(&report));
    }

    admin_sql(
        &pools,
        &database,
        "CREATE TABLE public.invoices (id int); CREATE TABLE public.orders (id int);",
    )
    .await;

    for name in ["connect", "read"] {
        let report = reconcile(&pools, &world, &secrets, "PostgresGrant", name)
            .await
            .unwrap_or_else(|f| panic!("grant {}: {}", name, f.error));
        world.set_status("PostgresGrant", name, owned_status(&report));
    }

    let state = snapshot(&pools, &database, &["public"]).await;
    let db = ObjectRef::new(GrantObjectType::Database, &database, "", "");
    assert!(state.acl(&reader, &db).is_some_and(|e| e.contains_key(&Privilege::Connect)));
    for table in ["invoices", "orders"] {
        let object = ObjectRef::new(GrantObjectType::Table, &database, "public", table);
        assert!(state.acl(&reader, &object).is_some_and(|e| e.contains_key(&Privilege::Select)));
    }

    // Dependents block the database until the grants are gone
    world.mark_deleting("PostgresDatabase", "db");
    let deferred = teardown(&pools, &world, "PostgresDatabase", "db").await;
    assert_eq!(deferred.unwrap_err().reason(), "DatabaseStillReferenced");

    for name in ["read", "connect"] {
        world.mark_deleting("PostgresGrant", name);
        teardown(&pools, &world, "PostgresGrant", name).await.unwrap();
        world.remove("PostgresGrant", name);
    }
    let state = snapshot(&pools, &database, &["public"]).await;
    assert!(state.acls.keys().all(|(grantee, _)| *grantee != reader));

    // Idle sessions inside the database would block DROP DATABASE
    pools.evict(&database);
    assert_eq!(teardown(&pools, &world, "PostgresDatabase", "db").await.unwrap(), 1);
    world.remove("PostgresDatabase", "db");
    let state = snapshot(&pools, pools.maintenance_database(), &[]).await;
    assert!(!state.has_database(&database));

    cleanup(&pools, &[&database], &[&owner, &reader]).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_list_setting_and_expiry_are_stable() {
    let pools = registry();
    let role = unique("path");
    let world = World::new().role(
        RoleBuilder::new("app", "it")
            .role_name(&role)
            .login()
            .setting("search_path", "$user, public")
            .valid_until("2030-01-01T00:00:00Z")
            .build(),
    );
    let secrets = MemorySecretStore::default();

    let report = reconcile(&pools, &world, &secrets, "PostgresRole", "app")
        .await
        .unwrap();
    assert!(report.applied >= 1);

    let state = snapshot(&pools, pools.maintenance_database(), &[]).await;
    let actual = &state.roles[&role];
    assert_eq!(
        actual.settings.get("search_path").map(String::as_str),
        Some("$user, public")
    );
    assert_eq!(actual.flags.valid_until, Some(1_893_456_000));

    let again = reconcile(&pools, &world, &secrets, "PostgresRole", "app")
        .await
        .unwrap();
    assert_eq!(again.applied, 0);

    cleanup(&pools, &[], &[&role]).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_grant_schema_change_revokes_old_schema() {
    let pools = registry();
    let reader = unique("mover");
    let database = unique("movedb");
    let mut world = World::new()
        .role(RoleBuilder::new("reader", "it").role_name(&reader).build())
        .database(
            DatabaseBuilder::new("db", "it", "postgres")
                .database_name(&database)
                .build(),
        );
    let secrets = MemorySecretStore::default();
    for (kind, name) in [("PostgresRole", "reader"), ("PostgresDatabase", "db")] {
        let report = reconcile(&pools, &world, &secrets, kind, name)
            .await
            .unwrap_or_else(|f| panic!("{} {}: {}", kind, name, f.error));
        world.set_status(kind, name, owned_status(&report));
    }
    admin_sql(
        &pools,
        &database,
        "CREATE SCHEMA legacy; CREATE TABLE legacy.invoices (id int); \
         CREATE TABLE public.invoices (id int);",
    )
    .await;

    let grant = |schema: &str| {
        GrantBuilder::table("read", "it", &reader, &database, schema)
            .privileges(&[Privilege::Select])
    };
    let first_world = World::new().grant(grant("legacy").build());
    let first = reconcile(&pools, &first_world, &secrets, "PostgresGrant", "read")
        .await
        .unwrap();
    assert_eq!(first.applied, 1);

    let owned: Vec<&str> = first.owned_objects.iter().map(String::as_str).collect();
    let mut moved_world = World::new().grant(grant("public").owning(&owned).build());
    let moved = reconcile(&pools, &moved_world, &secrets, "PostgresGrant", "read")
        .await
        .unwrap();
    assert!(moved.applied >= 2);
    moved_world.set_status("PostgresGrant", "read", owned_status(&moved));

    let state = snapshot(&pools, &database, &["legacy", "public"]).await;
    let legacy = ObjectRef::new(GrantObjectType::Table, &database, "legacy", "invoices");
    let public = ObjectRef::new(GrantObjectType::Table, &database, "public", "invoices");
    assert!(state.acl(&reader, &legacy).is_none());
    assert!(state.acl(&reader, &public).is_some());

    let again = reconcile(&pools, &moved_world, &secrets, "PostgresGrant", "read")
        .await
        .unwrap();
    assert_eq!(again.applied, 0);

    pools.evict(&database);
    cleanup(&pools, &[&database], &[&reader]).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_grants_to_owner_keep_owner_privileges() {
    let pools = registry();
    let owner = unique("dbowner");
    let database = unique("ownerdb");
    let mut world = World::new()
        .role(RoleBuilder::new("owner", "it").role_name(&owner).build())
        .database(DatabaseBuilder::new("db", "it", &owner).database_name(&database).build())
        .grant(
            GrantBuilder::database("connect", "it", &owner, &database)
                .privileges(&[Privilege::Connect])
                .build(),
        )
        .grant(
            GrantBuilder::schema("usage", "it", &owner, &database, "app")
                .privileges(&[Privilege::Usage])
                .build(),
        );
    let secrets = MemorySecretStore::default();
    for (kind, name) in [("PostgresRole", "owner"), ("PostgresDatabase", "db")] {
        let report = reconcile(&pools, &world, &secrets, kind, name)
            .await
            .unwrap_or_else(|f| panic!("{} {}: {}", kind, name, f.error));
        world.set_status(kind, name, owned_status(&report));
    }
    // Both statements turn the owner's implicit privileges into explicit ACL entries
    admin_sql(
        &pools,
        &database,
        &format!(
            "REVOKE TEMPORARY ON DATABASE {db} FROM PUBLIC; \
             CREATE SCHEMA app AUTHORIZATION {owner}; \
             GRANT USAGE ON SCHEMA app TO PUBLIC;",
            db = quote_identifier(&database),
            owner = quote_identifier(&owner),
        ),
    )
    .await;

    for _ in 0..2 {
        for name in ["connect", "usage"] {
            let report = reconcile(&pools, &world, &secrets, "PostgresGrant", name)
                .await
                .unwrap_or_else(|f| panic!("grant {}: {}", name, f.error));
            assert_eq!(report.applied, 0, "grant {} touched the owner", name);
            assert!(report.owned_objects.is_empty());
        }
    }

    let state = snapshot(&pools, &database, &["app"]).await;
    let db = ObjectRef::new(GrantObjectType::Database, &database, "", "");
    let schema = ObjectRef::new(GrantObjectType::Schema, &database, "app", "");
    assert_eq!(state.acl(&owner, &db).map(|e| e.len()), Some(3));
    assert_eq!(state.acl(&owner, &schema).map(|e| e.len()), Some(2));

    pools.evict(&database);
    cleanup(&pools, &[&database], &[&owner]).await;
}
