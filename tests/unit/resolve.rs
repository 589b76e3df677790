//! Unit tests for desired-state resolution

use std::time::Duration;

use postgres_access_operator::crd::{ManagedResource, Privilege};
use postgres_access_operator::engine::{
    ExternalRef, ObjectRef, ObjectSelector, OwnedObject, ResolveError, resolve,
};
use postgres_access_operator::crd::GrantObjectType;

use crate::common::*;

fn invalid_message(err: ResolveError) -> String {
    match err {
        ResolveError::Invalid(message) => message,
        other => panic!("expected invalid spec, got {:?}", other),
    }
}

mod role_resolution {
    use super::*;

    #[test]
    fn test_role_attributes_carried_over() {
        let world = World::new().role(
            RoleBuilder::new("app", "apps")
                .login()
                .createdb()
                .connection_limit(10)
                .comment("application role")
                .build(),
        );
        let desired = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap();

        assert_eq!(desired.roles.len(), 1);
        let role = &desired.roles[0];
        assert_eq!(role.name, "app");
        assert!(role.flags.login);
        assert!(role.flags.createdb);
        assert!(role.flags.inherit);
        assert!(!role.flags.superuser);
        assert_eq!(role.flags.connection_limit, 10);
        assert_eq!(role.comment.as_deref(), Some("application role"));
        assert!(desired.credential.is_none());
    }

    #[test]
    fn test_empty_comment_is_no_comment() {
        let world = World::new().role(RoleBuilder::new("app", "apps").comment("").build());
        let desired = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap();
        assert!(desired.roles[0].comment.is_none());
    }

    #[test]
    fn test_setting_names_are_lowercased() {
        let world = World::new().role(
            RoleBuilder::new("app", "apps")
                .setting("Statement_Timeout", "30s")
                .setting("app.tenant", "acme")
                .build(),
        );
        let desired = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap();
        let settings = &desired.roles[0].settings;
        assert_eq!(settings.get("statement_timeout").map(String::as_str), Some("30s"));
        assert_eq!(settings.get("app.tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn test_invalid_setting_name_rejected() {
        let world = World::new().role(
            RoleBuilder::new("app", "apps")
                .setting("work_mem; DROP ROLE x", "1MB")
                .build(),
        );
        let err = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("setting"));
    }

    #[test]
    fn test_overlong_name_rejected() {
        let long = "r".repeat(64);
        let world = World::new().role(RoleBuilder::new("app", "apps").role_name(&long).build());
        let err = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("not a valid identifier"));
    }

    #[test]
    fn test_connection_limit_below_minus_one_rejected() {
        let world =
            World::new().role(RoleBuilder::new("app", "apps").connection_limit(-2).build());
        let err = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("connectionLimit"));
    }

    #[test]
    fn test_self_membership_rejected() {
        let world = World::new().role(RoleBuilder::new("app", "apps").member_of("app").build());
        let err = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("member of itself"));
    }

    #[test]
    fn test_rotation_requires_secret() {
        let world = World::new().role(RoleBuilder::new("app", "apps").rotation("30d").build());
        let err = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("passwordSecretRef"));
    }

    #[test]
    fn test_bad_rotation_interval_rejected() {
        let world = World::new().role(
            RoleBuilder::new("app", "apps")
                .password_secret("app-pw")
                .rotation("fortnightly")
                .build(),
        );
        let err = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("fortnightly"));
    }

    #[test]
    fn test_valid_until_parsed() {
        let world = World::new().role(
            RoleBuilder::new("app", "apps")
                .valid_until("2030-01-01T02:00:00+02:00")
                .build(),
        );
        let desired = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap();
        assert_eq!(desired.roles[0].flags.valid_until, Some(1_893_456_000));

        let world = World::new().role(RoleBuilder::new("app", "apps").valid_until("soon").build());
        let err = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("validUntil"));
    }

    #[test]
    fn test_list_setting_value_normalized() {
        let world = World::new().role(
            RoleBuilder::new("app", "apps")
                .setting("search_path", "\"$user\",public")
                .build(),
        );
        let desired = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap();
        assert_eq!(desired.roles[0].settings["search_path"], "$user, public");
    }

    #[test]
    fn test_credential_defaults_to_own_namespace() {
        let world = World::new().role(
            RoleBuilder::new("app", "apps")
                .login()
                .password_secret("app-pw")
                .rotation("12h")
                .build(),
        );
        let desired = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap();
        let credential = desired.credential.unwrap();
        assert_eq!(credential.role, "app");
        assert_eq!(credential.secret_namespace, "apps");
        assert_eq!(credential.secret_name, "app-pw");
        assert_eq!(credential.rotation, Some(Duration::from_secs(12 * 3600)));
    }

    #[test]
    fn test_credential_in_other_namespace() {
        let world = World::new().role(
            RoleBuilder::new("app", "apps")
                .password_secret_in("vault", "app-pw")
                .build(),
        );
        let desired = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap();
        assert_eq!(desired.credential.unwrap().secret_namespace, "vault");
    }

    #[test]
    fn test_previously_owned_parsed_from_status() {
        let world = World::new().role(
            RoleBuilder::new("app", "apps")
                .owning(&["role:app", "membership:readers/app", "garbage"])
                .build(),
        );
        let desired = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap();
        assert_eq!(desired.previously_owned.len(), 2);
        assert!(desired.previously_owned.contains(&OwnedObject::Role("app".into())));
    }

    #[test]
    fn test_deleting_parent_does_not_count_as_declared() {
        let world = World::new()
            .role(RoleBuilder::new("readers", "apps").deleting().build())
            .role(RoleBuilder::new("app", "apps").member_of("readers").build());
        let desired = resolve(&world.managed("PostgresRole", "app"), &world.related).unwrap();
        assert!(desired.ensure_roles.is_empty());
        assert!(
            desired
                .external_refs
                .contains(&ExternalRef::Role("readers".into()))
        );
    }
}

mod database_resolution {
    use super::*;

    #[test]
    fn test_owner_declared_elsewhere_is_ensured() {
        let world = World::new()
            .role(RoleBuilder::new("app", "apps").build())
            .database(DatabaseBuilder::new("orders", "apps", "app").build());
        let desired =
            resolve(&world.managed("PostgresDatabase", "orders"), &world.related).unwrap();
        assert!(desired.ensure_roles.contains("app"));
        assert_eq!(desired.databases[0].owner, "app");
        assert!(!desired.reclaim_databases);
    }

    #[test]
    fn test_undeclared_owner_is_external() {
        let world = World::new().database(DatabaseBuilder::new("orders", "apps", "legacy").build());
        let desired =
            resolve(&world.managed("PostgresDatabase", "orders"), &world.related).unwrap();
        assert!(
            desired
                .external_refs
                .contains(&ExternalRef::Role("legacy".into()))
        );
    }

    #[test]
    fn test_reclaim_policy_delete() {
        let world = World::new()
            .database(DatabaseBuilder::new("orders", "apps", "postgres").reclaim_delete().build());
        let desired =
            resolve(&world.managed("PostgresDatabase", "orders"), &world.related).unwrap();
        assert!(desired.reclaim_databases);
    }
}

mod grant_resolution {
    use super::*;

    #[test]
    fn test_table_grant_records_schema_scope_and_refs() {
        let world = World::new().grant(
            GrantBuilder::table("read", "apps", "app", "orders", "sales")
                .objects(&["invoices", "audit_*"])
                .privileges(&[Privilege::Select])
                .build(),
        );
        let desired = resolve(&world.managed("PostgresGrant", "read"), &world.related).unwrap();

        assert!(desired.scope.schemas.contains("sales"));
        assert!(desired.external_refs.contains(&ExternalRef::Database("orders".into())));
        assert!(desired.external_refs.contains(&ExternalRef::Object(ObjectRef::new(
            GrantObjectType::Schema,
            "orders",
            "sales",
            ""
        ))));
        // Literal names must exist, patterns need not match anything
        assert!(desired.external_refs.contains(&ExternalRef::Object(ObjectRef::new(
            GrantObjectType::Table,
            "orders",
            "sales",
            "invoices"
        ))));
        assert_eq!(
            desired
                .external_refs
                .iter()
                .filter(|r| matches!(r, ExternalRef::Object(_)))
                .count(),
            2
        );
        assert_eq!(
            desired.grants[0].selector,
            ObjectSelector::Patterns(vec!["invoices".into(), "audit_*".into()])
        );
    }

    #[test]
    fn test_previous_schemas_are_read() {
        let world = World::new().grant(
            GrantBuilder::table("read", "apps", "app", "orders", "public")
                .privileges(&[Privilege::Select])
                .owning(&[
                    "acl:orders/table/legacy/invoices/app",
                    "acl:archive/table/old/invoices/app",
                ])
                .build(),
        );
        let desired = resolve(&world.managed("PostgresGrant", "read"), &world.related).unwrap();
        let schemas: Vec<&str> = desired.scope.schemas.iter().map(String::as_str).collect();
        // Only schemas in the connected database can be read
        assert_eq!(schemas, vec!["legacy", "public"]);
    }

    #[test]
    fn test_empty_objects_selects_all() {
        let world = World::new().grant(
            GrantBuilder::sequence("seq", "apps", "app", "orders", "public")
                .privileges(&[Privilege::Usage])
                .build(),
        );
        let desired = resolve(&world.managed("PostgresGrant", "seq"), &world.related).unwrap();
        assert_eq!(desired.grants[0].selector, ObjectSelector::All);
    }

    #[test]
    fn test_declared_database_is_not_external() {
        let world = World::new()
            .database(DatabaseBuilder::new("orders", "apps", "postgres").build())
            .grant(
                GrantBuilder::database("connect", "apps", "app", "orders")
                    .privileges(&[Privilege::Connect])
                    .build(),
            );
        let desired = resolve(&world.managed("PostgresGrant", "connect"), &world.related).unwrap();
        assert!(!desired.external_refs.contains(&ExternalRef::Database("orders".into())));
        assert!(desired.scope.schemas.is_empty());
    }

    #[test]
    fn test_empty_privileges_rejected() {
        let world =
            World::new().grant(GrantBuilder::database("connect", "apps", "app", "orders").build());
        let err = resolve(&world.managed("PostgresGrant", "connect"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("must not be empty"));
    }

    #[test]
    fn test_privilege_not_valid_for_type() {
        let world = World::new().grant(
            GrantBuilder::schema("usage", "apps", "app", "orders", "public")
                .privileges(&[Privilege::Usage, Privilege::Select])
                .build(),
        );
        let err = resolve(&world.managed("PostgresGrant", "usage"), &world.related).unwrap_err();
        let message = invalid_message(err);
        assert!(message.contains("SELECT"));
        assert!(message.contains("schema"));
    }

    #[test]
    fn test_schema_required_for_tables() {
        let world = World::new().grant(
            GrantBuilder::table("read", "apps", "app", "orders", "public")
                .schema_name(None)
                .privileges(&[Privilege::Select])
                .build(),
        );
        let err = resolve(&world.managed("PostgresGrant", "read"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("schema is required"));
    }

    #[test]
    fn test_schema_forbidden_for_database_grants() {
        let world = World::new().grant(
            GrantBuilder::database("connect", "apps", "app", "orders")
                .schema_name(Some("public"))
                .privileges(&[Privilege::Connect])
                .build(),
        );
        let err = resolve(&world.managed("PostgresGrant", "connect"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("must not be set"));
    }

    #[test]
    fn test_objects_forbidden_for_schema_grants() {
        let world = World::new().grant(
            GrantBuilder::schema("usage", "apps", "app", "orders", "public")
                .objects(&["orders"])
                .privileges(&[Privilege::Usage])
                .build(),
        );
        let err = resolve(&world.managed("PostgresGrant", "usage"), &world.related).unwrap_err();
        assert!(invalid_message(err).contains("objects must not be set"));
    }

    #[test]
    fn test_unresolved_is_not_invalid() {
        let world = World::new().grant(
            GrantBuilder::database("connect", "apps", "ghost", "orders")
                .privileges(&[Privilege::Connect])
                .build(),
        );
        // Missing references surface when the snapshot is checked, not here
        let desired = resolve(&world.managed("PostgresGrant", "connect"), &world.related).unwrap();
        assert!(desired.external_refs.contains(&ExternalRef::Role("ghost".into())));
    }

    #[test]
    fn test_foreign_claims_exclude_self() {
        let world = World::new()
            .grant(
                GrantBuilder::database("a", "apps", "app", "orders")
                    .privileges(&[Privilege::Connect])
                    .owning(&["acl:orders/database///app"])
                    .build(),
            )
            .grant(
                GrantBuilder::database("b", "apps", "app", "orders")
                    .privileges(&[Privilege::Connect])
                    .build(),
            );
        let a = resolve(&world.managed("PostgresGrant", "a"), &world.related).unwrap();
        assert!(a.foreign_claims.is_empty());

        let b = resolve(&world.managed("PostgresGrant", "b"), &world.related).unwrap();
        let claim = OwnedObject::acl("app", ObjectRef::new(GrantObjectType::Database, "orders", "", ""));
        assert_eq!(b.foreign_claims.get(&claim).map(|k| k.name.as_str()), Some("a"));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let world = World::new()
            .role(RoleBuilder::new("app", "apps").member_of("b").member_of("a").build());
        let resource: ManagedResource = world.managed("PostgresRole", "app");
        let first = resolve(&resource, &world.related).unwrap();
        let second = resolve(&resource, &world.related).unwrap();
        assert_eq!(first, second);
    }
}
