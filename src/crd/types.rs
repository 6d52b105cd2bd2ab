//! Shared types used by every Vault resource kind

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::vault::duration::parse_duration;

/// Structured validation error for resource specs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

/// Join a list of validation errors into a single condition message
pub fn summarize_validation_errors(errors: &[SpecValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Reference to the service account whose identity is used to log into Vault
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServiceAccountRef {
    #[serde(default = "default_service_account")]
    pub name: String,
}

impl Default for ServiceAccountRef {
    fn default() -> Self {
        Self {
            name: default_service_account(),
        }
    }
}

fn default_service_account() -> String {
    "default".to_string()
}

fn default_auth_path() -> String {
    "kubernetes".to_string()
}

/// Kubernetes auth configuration used to obtain a Vault token
///
/// The role must hold create/read/update/delete capabilities on the path of
/// the object being managed.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeAuthConfiguration {
    /// Service account in the resource namespace whose token is exchanged
    #[serde(default)]
    pub service_account: ServiceAccountRef,

    /// Mount path of the Kubernetes auth engine
    #[serde(default = "default_auth_path")]
    pub path: String,

    /// Vault role to log in with
    pub role: String,

    /// Vault (enterprise) namespace to log into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Default for KubeAuthConfiguration {
    fn default() -> Self {
        Self {
            service_account: ServiceAccountRef::default(),
            path: default_auth_path(),
            role: String::new(),
            namespace: None,
        }
    }
}

impl KubeAuthConfiguration {
    pub fn mount_path(&self) -> &str {
        self.path.trim_matches('/')
    }

    pub fn service_account_name(&self) -> &str {
        &self.service_account.name
    }

    pub fn validate(&self, errors: &mut Vec<SpecValidationError>) {
        if self.role.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.authentication.role",
                "authentication.role must not be empty",
                "Set spec.authentication.role to a Vault role bound to the service account.",
            ));
        }
        if self.mount_path().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.authentication.path",
                "authentication.path must not be empty",
                "Set spec.authentication.path to the mount of the Kubernetes auth engine, e.g. kubernetes.",
            ));
        }
        if self.service_account.name.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.authentication.serviceAccount.name",
                "serviceAccount.name must not be empty",
                "Omit spec.authentication.serviceAccount to use 'default', or name an existing service account.",
            ));
        }
    }
}

/// Condition for status reporting (Kubernetes convention)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Failed", "Progressing")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// The .metadata.generation that the condition was set based upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: &str, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Observed state shared by every Vault resource kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObjectStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation of the spec last written to Vault
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Validate a required Go-style duration field
pub(crate) fn validate_duration(
    field: &str,
    value: &str,
    minimum_secs: u64,
    errors: &mut Vec<SpecValidationError>,
) {
    match parse_duration(value) {
        Some(d) if d.as_secs() >= minimum_secs => {}
        Some(_) => errors.push(SpecValidationError::new(
            field,
            format!("{field} must be at least {minimum_secs}s"),
            format!("Increase {field} to {minimum_secs}s or more."),
        )),
        None => errors.push(SpecValidationError::new(
            field,
            format!("'{value}' is not a valid duration"),
            "Use a duration such as 30s, 15m, 24h or 1h30m.",
        )),
    }
}

/// Validate an optional duration field
pub(crate) fn validate_optional_duration(
    field: &str,
    value: Option<&str>,
    errors: &mut Vec<SpecValidationError>,
) {
    if let Some(value) = value {
        validate_duration(field, value, 0, errors);
    }
}
