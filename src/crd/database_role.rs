//! DatabaseSecretEngineRole Custom Resource Definition
//!
//! A dynamic role tells Vault how to create short-lived database users on
//! demand.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    summarize_validation_errors, validate_optional_duration, KubeAuthConfiguration,
    RemoteObjectStatus, SpecValidationError,
};
use crate::controller::{ConditionsAware, RemoteObject};
use crate::error::{Error, Result};
use crate::vault::duration::parse_duration;
use crate::vault::{resolve, FieldKind, Payload, PayloadShape, VaultPath};

const SHAPE: PayloadShape = PayloadShape::new(&[
    ("default_ttl", FieldKind::Duration),
    ("max_ttl", FieldKind::Duration),
    ("creation_statements", FieldKind::List),
    ("revocation_statements", FieldKind::List),
    ("rollback_statements", FieldKind::List),
    ("renew_statements", FieldKind::List),
]);

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "redhatcop.redhat.io",
    version = "v1alpha1",
    kind = "DatabaseSecretEngineRole",
    namespaced,
    status = "RemoteObjectStatus",
    shortname = "dbrole",
    printcolumn = r#"{"name":"Path","type":"string","jsonPath":".spec.path"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSecretEngineRoleSpec {
    #[serde(default)]
    pub authentication: KubeAuthConfiguration,

    /// Mount path of the database secret engine
    pub path: String,

    /// Name of the database connection to use for this role
    #[serde(rename = "dBName")]
    pub db_name: String,

    /// Default TTL for leases, e.g. "1h"; the engine default when unset
    #[serde(rename = "defaultTTL", default, skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<String>,

    /// Maximum TTL for leases
    #[serde(rename = "maxTTL", default, skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<String>,

    /// Statements that create and configure the dynamic user
    #[serde(default)]
    pub creation_statements: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revocation_statements: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_statements: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub renew_statements: Vec<String>,
}

impl DatabaseSecretEngineRoleSpec {
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();
        self.authentication.validate(&mut errors);

        if self.db_name.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.dBName",
                "dBName must not be empty",
                "Set spec.dBName to the name of a configured database connection.",
            ));
        }
        if self.creation_statements.iter().all(|s| s.trim().is_empty()) {
            errors.push(SpecValidationError::new(
                "spec.creationStatements",
                "at least one creation statement is required",
                "Add the SQL that creates the dynamic user, using {{name}} and {{password}} placeholders.",
            ));
        }

        validate_optional_duration("spec.defaultTTL", self.default_ttl.as_deref(), &mut errors);
        validate_optional_duration("spec.maxTTL", self.max_ttl.as_deref(), &mut errors);

        let default_ttl = self.default_ttl.as_deref().and_then(parse_duration);
        let max_ttl = self.max_ttl.as_deref().and_then(parse_duration);
        if let (Some(default_ttl), Some(max_ttl)) = (default_ttl, max_ttl) {
            if max_ttl < default_ttl {
                errors.push(SpecValidationError::new(
                    "spec.maxTTL",
                    format!(
                        "maxTTL ({}s) must not be lower than defaultTTL ({}s)",
                        max_ttl.as_secs(),
                        default_ttl.as_secs()
                    ),
                    "Raise spec.maxTTL or lower spec.defaultTTL.",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_payload(&self) -> Payload {
        Payload::new()
            .with("db_name", self.db_name.as_str())
            .with_opt("default_ttl", self.default_ttl.as_deref())
            .with_opt("max_ttl", self.max_ttl.as_deref())
            .with("creation_statements", self.creation_statements.clone())
            .with("revocation_statements", self.revocation_statements.clone())
            .with("rollback_statements", self.rollback_statements.clone())
            .with("renew_statements", self.renew_statements.clone())
    }
}

impl RemoteObject for DatabaseSecretEngineRole {
    fn remote_path(&self) -> Result<VaultPath> {
        resolve(&self.spec.path, "roles", &self.name_any())
    }

    fn desired_payload(&self) -> Payload {
        self.spec.to_payload()
    }

    fn payload_shape(&self) -> &'static PayloadShape {
        &SHAPE
    }

    fn validate(&self) -> Result<()> {
        self.spec
            .validate()
            .map_err(|errors| Error::ValidationError(summarize_validation_errors(&errors)))
    }

    fn auth_configuration(&self) -> &KubeAuthConfiguration {
        &self.spec.authentication
    }
}

impl ConditionsAware for DatabaseSecretEngineRole {
    fn remote_status(&self) -> Option<&RemoteObjectStatus> {
        self.status.as_ref()
    }
}
