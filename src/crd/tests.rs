//! Unit tests for resource spec validation, path resolution and payloads

#[cfg(test)]
mod database_static_role {
    use serde_json::json;

    use crate::controller::RemoteObject;
    use crate::crd::{
        DatabaseSecretEngineStaticRole, DatabaseSecretEngineStaticRoleSpec, KubeAuthConfiguration,
        SpecValidationError,
    };
    use crate::error::Error;

    /// Helper to create a minimal valid static role spec
    fn valid_spec() -> DatabaseSecretEngineStaticRoleSpec {
        DatabaseSecretEngineStaticRoleSpec {
            authentication: KubeAuthConfiguration {
                role: "db-admin".to_string(),
                ..Default::default()
            },
            path: "db".to_string(),
            username: "svc".to_string(),
            rotation_period: "24h".to_string(),
            db_name: "app".to_string(),
            rotation_statements: vec![],
        }
    }

    fn fields(errors: &[SpecValidationError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn test_rotation_period_minimum() {
        let mut spec = valid_spec();
        spec.rotation_period = "4s".to_string();
        let errors = spec.validate().unwrap_err();
        assert_eq!(fields(&errors), vec!["spec.rotationPeriod"]);

        spec.rotation_period = "5s".to_string();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_rotation_period_must_parse() {
        let mut spec = valid_spec();
        spec.rotation_period = "daily".to_string();
        let errors = spec.validate().unwrap_err();
        assert!(errors[0].message.contains("not a valid duration"));
    }

    #[test]
    fn test_missing_required_fields_are_all_reported() {
        let mut spec = valid_spec();
        spec.username = String::new();
        spec.db_name = " ".to_string();
        spec.authentication.role = String::new();
        let errors = spec.validate().unwrap_err();
        assert_eq!(
            fields(&errors),
            vec!["spec.authentication.role", "spec.username", "spec.dBName"]
        );
    }

    #[test]
    fn test_remote_path_uses_metadata_name() {
        let role = DatabaseSecretEngineStaticRole::new("db-role-a", valid_spec());
        assert_eq!(
            role.remote_path().unwrap().as_str(),
            "db/static-roles/db-role-a"
        );
    }

    #[test]
    fn test_remote_path_rejects_empty_mount() {
        let mut spec = valid_spec();
        spec.path = String::new();
        let role = DatabaseSecretEngineStaticRole::new("db-role-a", spec);
        assert!(matches!(role.remote_path(), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn test_payload_wire_names() {
        let role = DatabaseSecretEngineStaticRole::new("db-role-a", valid_spec());
        assert_eq!(
            serde_json::to_value(role.desired_payload()).unwrap(),
            json!({
                "username": "svc",
                "rotation_period": "24h",
                "db_name": "app",
                "rotation_statements": [],
            })
        );
    }

    #[test]
    fn test_equivalent_to_vault_echo() {
        let mut spec = valid_spec();
        spec.rotation_statements = vec!["ALTER USER".to_string(), "GRANT".to_string()];
        let role = DatabaseSecretEngineStaticRole::new("db-role-a", spec);
        let observed = serde_json::from_value(json!({
            "username": "svc",
            "rotation_period": 86400,
            "db_name": "app",
            "rotation_statements": ["GRANT", "ALTER USER"],
            "last_vault_rotation": "2024-06-01T00:00:00Z",
            "credential_type": "password",
        }))
        .unwrap();
        assert!(role.is_equivalent_to_desired_state(Some(&observed)));
    }

    #[test]
    fn test_deserializes_camel_case_manifest() {
        let spec: DatabaseSecretEngineStaticRoleSpec = serde_json::from_value(json!({
            "authentication": {"role": "db-admin"},
            "path": "db",
            "username": "svc",
            "rotationPeriod": "1h",
            "dBName": "app",
        }))
        .unwrap();
        assert_eq!(spec.db_name, "app");
        assert_eq!(spec.authentication.path, "kubernetes");
        assert_eq!(spec.authentication.service_account.name, "default");
        assert!(spec.rotation_statements.is_empty());
    }

    #[test]
    fn test_validate_maps_to_validation_error() {
        let mut spec = valid_spec();
        spec.username = String::new();
        let role = DatabaseSecretEngineStaticRole::new("db-role-a", spec);
        match role.validate() {
            Err(Error::ValidationError(msg)) => assert!(msg.contains("spec.username")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}

#[cfg(test)]
mod database_role {
    use serde_json::json;

    use crate::controller::RemoteObject;
    use crate::crd::{DatabaseSecretEngineRole, DatabaseSecretEngineRoleSpec, KubeAuthConfiguration};

    fn valid_spec() -> DatabaseSecretEngineRoleSpec {
        DatabaseSecretEngineRoleSpec {
            authentication: KubeAuthConfiguration {
                role: "db-admin".to_string(),
                ..Default::default()
            },
            path: "database".to_string(),
            db_name: "app".to_string(),
            default_ttl: Some("1h".to_string()),
            max_ttl: Some("24h".to_string()),
            creation_statements: vec!["CREATE ROLE \"{{name}}\"".to_string()],
            revocation_statements: vec![],
            rollback_statements: vec![],
            renew_statements: vec![],
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn test_creation_statements_required() {
        let mut spec = valid_spec();
        spec.creation_statements.clear();
        let errors = spec.validate().unwrap_err();
        assert_eq!(errors[0].field, "spec.creationStatements");
    }

    #[test]
    fn test_max_ttl_below_default_ttl_rejected() {
        let mut spec = valid_spec();
        spec.max_ttl = Some("30m".to_string());
        let errors = spec.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "spec.maxTTL");
    }

    #[test]
    fn test_ttls_are_optional() {
        let mut spec = valid_spec();
        spec.default_ttl = None;
        spec.max_ttl = None;
        assert!(spec.validate().is_ok());
        assert!(spec.to_payload().get("default_ttl").is_none());
    }

    #[test]
    fn test_remote_path() {
        let role = DatabaseSecretEngineRole::new("reader", valid_spec());
        assert_eq!(role.remote_path().unwrap().as_str(), "database/roles/reader");
    }

    #[test]
    fn test_ttl_echo_is_equivalent() {
        let role = DatabaseSecretEngineRole::new("reader", valid_spec());
        let observed = serde_json::from_value(json!({
            "db_name": "app",
            "default_ttl": 3600,
            "max_ttl": 86400,
            "creation_statements": ["CREATE ROLE \"{{name}}\""],
            "credential_type": "password",
        }))
        .unwrap();
        assert!(role.is_equivalent_to_desired_state(Some(&observed)));
    }
}

#[cfg(test)]
mod kubernetes_auth_role {
    use serde_json::json;

    use crate::controller::RemoteObject;
    use crate::crd::{KubeAuthConfiguration, KubernetesAuthEngineRole, KubernetesAuthEngineRoleSpec};
    use crate::error::Error;

    fn valid_spec() -> KubernetesAuthEngineRoleSpec {
        KubernetesAuthEngineRoleSpec {
            authentication: KubeAuthConfiguration {
                role: "policy-admin".to_string(),
                ..Default::default()
            },
            path: "kubernetes".to_string(),
            target_service_accounts: vec!["default".to_string()],
            target_namespaces: vec!["team-a".to_string()],
            policies: vec!["read-secrets".to_string(), "write-secrets".to_string()],
            token_ttl: Some("20m".to_string()),
            token_max_ttl: None,
            audience: None,
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn test_targets_required() {
        let mut spec = valid_spec();
        spec.target_service_accounts.clear();
        spec.target_namespaces.clear();
        let errors = spec.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_remote_path_is_under_auth() {
        let role = KubernetesAuthEngineRole::new("app", valid_spec());
        assert_eq!(
            role.remote_path().unwrap().as_str(),
            "auth/kubernetes/role/app"
        );

        let mut spec = valid_spec();
        spec.path = "/kubernetes/".to_string();
        let role = KubernetesAuthEngineRole::new("app", spec);
        assert_eq!(
            role.remote_path().unwrap().as_str(),
            "auth/kubernetes/role/app"
        );
    }

    #[test]
    fn test_empty_auth_mount_is_rejected() {
        for path in ["", "/", "//"] {
            let mut spec = valid_spec();
            spec.path = path.to_string();

            let errors = spec.validate().unwrap_err();
            assert!(errors.iter().any(|e| e.field == "spec.path"), "path {path:?}");

            let role = KubernetesAuthEngineRole::new("app", spec);
            assert!(
                matches!(role.remote_path(), Err(Error::InvalidPath(_))),
                "path {path:?}"
            );
        }
    }

    #[test]
    fn test_policy_order_is_ignored() {
        let role = KubernetesAuthEngineRole::new("app", valid_spec());
        let observed = serde_json::from_value(json!({
            "bound_service_account_names": ["default"],
            "bound_service_account_namespaces": ["team-a"],
            "token_policies": ["write-secrets", "read-secrets"],
            "token_ttl": 1200,
            "token_max_ttl": 0,
            "token_type": "default",
        }))
        .unwrap();
        assert!(role.is_equivalent_to_desired_state(Some(&observed)));
    }
}

#[cfg(test)]
mod schema {
    use kube::CustomResourceExt;

    use crate::crd::{DatabaseSecretEngineRole, DatabaseSecretEngineStaticRole, KubernetesAuthEngineRole};

    #[test]
    fn test_crds_share_group_and_version() {
        for crd in [
            DatabaseSecretEngineStaticRole::crd(),
            DatabaseSecretEngineRole::crd(),
            KubernetesAuthEngineRole::crd(),
        ] {
            assert_eq!(crd.spec.group, "redhatcop.redhat.io");
            assert_eq!(crd.spec.scope, "Namespaced");
            assert_eq!(crd.spec.versions[0].name, "v1alpha1");
            assert!(crd.spec.versions[0].subresources.is_some());
        }
    }
}
