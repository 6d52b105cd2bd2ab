//! KubernetesAuthEngineRole Custom Resource Definition

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    summarize_validation_errors, validate_optional_duration, KubeAuthConfiguration,
    RemoteObjectStatus, SpecValidationError,
};
use crate::controller::{ConditionsAware, RemoteObject};
use crate::error::{Error, Result};
use crate::vault::{resolve, FieldKind, Payload, PayloadShape, VaultPath};

const SHAPE: PayloadShape = PayloadShape::new(&[
    ("bound_service_account_names", FieldKind::Set),
    ("bound_service_account_namespaces", FieldKind::Set),
    ("token_policies", FieldKind::Set),
    ("token_ttl", FieldKind::Duration),
    ("token_max_ttl", FieldKind::Duration),
]);

/// Role on a Kubernetes auth engine, stored at `auth/{spec.path}/role/{metadata.name}`
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "redhatcop.redhat.io",
    version = "v1alpha1",
    kind = "KubernetesAuthEngineRole",
    namespaced,
    status = "RemoteObjectStatus",
    shortname = "kubeauthrole",
    printcolumn = r#"{"name":"Path","type":"string","jsonPath":".spec.path"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesAuthEngineRoleSpec {
    #[serde(default)]
    pub authentication: KubeAuthConfiguration,

    /// Mount path of the auth engine, without the `auth/` prefix
    pub path: String,

    /// Service account names able to log in with this role
    #[serde(default)]
    pub target_service_accounts: Vec<String>,

    /// Namespaces those service accounts may live in
    #[serde(default)]
    pub target_namespaces: Vec<String>,

    /// Policies attached to issued tokens
    #[serde(default)]
    pub policies: Vec<String>,

    #[serde(rename = "tokenTTL", default, skip_serializing_if = "Option::is_none")]
    pub token_ttl: Option<String>,

    #[serde(rename = "tokenMaxTTL", default, skip_serializing_if = "Option::is_none")]
    pub token_max_ttl: Option<String>,

    /// Audience claim required on the login JWT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl KubernetesAuthEngineRoleSpec {
    /// Auth mount with one leading and one trailing `/` removed
    pub fn mount(&self) -> &str {
        let path = self.path.strip_prefix('/').unwrap_or(&self.path);
        path.strip_suffix('/').unwrap_or(path)
    }

    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();
        self.authentication.validate(&mut errors);

        if self.mount().trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.path",
                "auth mount path must not be empty",
                "Set spec.path to the Kubernetes auth mount, e.g. \"kubernetes\".",
            ));
        }

        if self.target_service_accounts.is_empty() {
            errors.push(SpecValidationError::new(
                "spec.targetServiceAccounts",
                "at least one target service account is required",
                "List the service accounts allowed to log in, or use [\"*\"] for any.",
            ));
        }
        if self.target_namespaces.is_empty() {
            errors.push(SpecValidationError::new(
                "spec.targetNamespaces",
                "at least one target namespace is required",
                "List the namespaces allowed to log in, or use [\"*\"] for any.",
            ));
        }
        validate_optional_duration("spec.tokenTTL", self.token_ttl.as_deref(), &mut errors);
        validate_optional_duration("spec.tokenMaxTTL", self.token_max_ttl.as_deref(), &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_payload(&self) -> Payload {
        Payload::new()
            .with(
                "bound_service_account_names",
                self.target_service_accounts.clone(),
            )
            .with(
                "bound_service_account_namespaces",
                self.target_namespaces.clone(),
            )
            .with("token_policies", self.policies.clone())
            .with_opt("token_ttl", self.token_ttl.as_deref())
            .with_opt("token_max_ttl", self.token_max_ttl.as_deref())
            .with_opt("audience", self.audience.as_deref())
    }
}

impl RemoteObject for KubernetesAuthEngineRole {
    fn remote_path(&self) -> Result<VaultPath> {
        let mount = self.spec.mount();
        if mount.is_empty() {
            return Err(Error::InvalidPath(format!(
                "auth mount path {:?} is empty",
                self.spec.path
            )));
        }
        resolve(&format!("auth/{mount}"), "role", &self.name_any())
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

impl ConditionsAware for KubernetesAuthEngineRole {
    fn remote_status(&self) -> Option<&RemoteObjectStatus> {
        self.status.as_ref()
    }
}
