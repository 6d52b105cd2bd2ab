//! Vault remote API surface
//!
//! The reconciler talks to Vault only through the [`VaultApi`] trait. The
//! production implementation is [`client::VaultClient`]; tests substitute an
//! in-memory fake.

pub mod client;
pub mod duration;
pub mod equivalence;
pub mod path;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use client::VaultClient;
pub use equivalence::{is_equivalent, FieldKind, PayloadShape};
pub use path::{resolve, VaultPath};

/// Ordered mapping from wire field name to value
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Insert only when the value is present
    pub fn with_opt<T: Into<Value>>(mut self, field: &str, value: Option<T>) -> Self {
        if let Some(v) = value {
            self.insert(field, v);
        }
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Payload {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Short-lived Vault client token
///
/// Carries the Vault namespace it was issued in so every call made with it
/// is addressed to the same namespace. Never serialized and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultToken {
    value: String,
    namespace: Option<String>,
}

impl VaultToken {
    pub fn new(value: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            value: value.into(),
            namespace,
        }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Debug for VaultToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultToken")
            .field("value", &"<redacted>")
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Result of a successful login exchange
#[derive(Clone, Debug)]
pub struct LoginResponse {
    pub token: VaultToken,
    /// Zero means the token does not expire
    pub ttl: Duration,
    pub renewable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Outbound operations against the secret service
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// Exchange an identity JWT for a client token at `auth/<mount>/login`
    async fn login(
        &self,
        mount: &str,
        role: &str,
        jwt: &str,
        namespace: Option<&str>,
    ) -> Result<LoginResponse>;

    /// Read the object at `path`; `None` when it does not exist
    async fn read(&self, token: &VaultToken, path: &VaultPath) -> Result<Option<Payload>>;

    /// Create or update the object at `path`
    async fn write(&self, token: &VaultToken, path: &VaultPath, payload: &Payload) -> Result<()>;

    async fn delete(&self, token: &VaultToken, path: &VaultPath) -> Result<DeleteOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_debug_is_redacted() {
        let token = VaultToken::new("hvs.super-secret", Some("team-a".to_string()));
        let printed = format!("{token:?}");
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("team-a"));
    }

    #[test]
    fn test_payload_is_ordered_and_skips_none() {
        let payload = Payload::new()
            .with("username", "svc")
            .with("db_name", "app")
            .with_opt::<String>("audience", None);

        let keys: Vec<&String> = payload.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["db_name", "username"]);
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"db_name": "app", "username": "svc"})
        );
    }
}
