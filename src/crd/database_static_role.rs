//! DatabaseSecretEngineStaticRole Custom Resource Definition
//!
//! A static role maps one existing database user onto a Vault-managed
//! password that Vault rotates on a fixed period.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    summarize_validation_errors, validate_duration, KubeAuthConfiguration, RemoteObjectStatus,
    SpecValidationError,
};
use crate::controller::{ConditionsAware, RemoteObject};
use crate::error::{Error, Result};
use crate::vault::{resolve, FieldKind, Payload, PayloadShape, VaultPath};

/// Vault refuses rotation periods shorter than this
pub const MIN_ROTATION_PERIOD_SECS: u64 = 5;

const SHAPE: PayloadShape = PayloadShape::new(&[
    ("rotation_period", FieldKind::Duration),
    ("rotation_statements", FieldKind::Set),
]);

/// The DatabaseSecretEngineStaticRole CRD
///
/// The final Vault path is `{spec.path}/static-roles/{metadata.name}`,
/// inside the Vault namespace selected by `spec.authentication.namespace`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "redhatcop.redhat.io",
    version = "v1alpha1",
    kind = "DatabaseSecretEngineStaticRole",
    namespaced,
    status = "RemoteObjectStatus",
    shortname = "dbstaticrole",
    printcolumn = r#"{"name":"Path","type":"string","jsonPath":".spec.path"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSecretEngineStaticRoleSpec {
    /// Kube auth configuration used to execute this request
    #[serde(default)]
    pub authentication: KubeAuthConfiguration,

    /// Mount path of the database secret engine
    pub path: String,

    /// Database username this Vault role corresponds to
    pub username: String,

    /// How long Vault waits before rotating the password, e.g. "24h"
    pub rotation_period: String,

    /// Name of the database connection to use for this role
    #[serde(rename = "dBName")]
    pub db_name: String,

    /// Statements executed to rotate the password
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rotation_statements: Vec<String>,
}

impl DatabaseSecretEngineStaticRoleSpec {
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();
        self.authentication.validate(&mut errors);

        if self.username.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.username",
                "username must not be empty",
                "Set spec.username to the database user whose password Vault rotates.",
            ));
        }
        if self.db_name.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.dBName",
                "dBName must not be empty",
                "Set spec.dBName to the name of a configured database connection.",
            ));
        }
        validate_duration(
            "spec.rotationPeriod",
            &self.rotation_period,
            MIN_ROTATION_PERIOD_SECS,
            &mut errors,
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_payload(&self) -> Payload {
        Payload::new()
            .with("username", self.username.as_str())
            .with("rotation_period", self.rotation_period.as_str())
            .with("db_name", self.db_name.as_str())
            .with("rotation_statements", self.rotation_statements.clone())
    }
}

impl RemoteObject for DatabaseSecretEngineStaticRole {
    fn remote_path(&self) -> Result<VaultPath> {
        resolve(&self.spec.path, "static-roles", &self.name_any())
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

impl ConditionsAware for DatabaseSecretEngineStaticRole {
    fn remote_status(&self) -> Option<&RemoteObjectStatus> {
        self.status.as_ref()
    }
}
