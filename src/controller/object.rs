//! Capabilities a resource kind must provide to be reconciled against Vault

use std::fmt;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};

use super::conditions::{is_condition_true, CONDITION_TYPE_READY};
use super::finalizers::VAULT_CLEANUP_FINALIZER;
use crate::crd::{Condition, KubeAuthConfiguration, RemoteObjectStatus};
use crate::error::Result;
use crate::vault::{is_equivalent, Payload, PayloadShape, VaultPath};

/// A declarative resource that maps onto exactly one Vault object
pub trait RemoteObject {
    /// Canonical Vault path of the object
    fn remote_path(&self) -> Result<VaultPath>;

    /// Wire payload derived entirely from the spec
    fn desired_payload(&self) -> Payload;

    /// Field kinds used when comparing against what Vault echoes back
    fn payload_shape(&self) -> &'static PayloadShape;

    fn is_equivalent_to_desired_state(&self, observed: Option<&Payload>) -> bool {
        is_equivalent(&self.desired_payload(), observed, self.payload_shape())
    }

    /// Local validation; failures are terminal until the spec changes
    fn validate(&self) -> Result<()>;

    fn auth_configuration(&self) -> &KubeAuthConfiguration;
}

/// Read access to the reported condition set
pub trait ConditionsAware {
    fn remote_status(&self) -> Option<&RemoteObjectStatus>;

    fn conditions(&self) -> &[Condition] {
        self.remote_status()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }

    fn is_ready(&self) -> bool {
        is_condition_true(self.conditions(), CONDITION_TYPE_READY)
    }
}

/// Identity of a resource within the work queue
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Everything the reconciler needs from a resource, independent of its kind
pub trait ManagedObject: RemoteObject + ConditionsAware + Send + Sync {
    fn object_key(&self) -> ObjectKey;

    fn generation(&self) -> Option<i64>;

    fn is_being_deleted(&self) -> bool;

    fn has_finalizer(&self) -> bool;

    /// Namespace holding the service account used for login
    fn identity_namespace(&self) -> String;
}

impl<K> ManagedObject for K
where
    K: Resource<DynamicType = ()> + RemoteObject + ConditionsAware + Send + Sync,
{
    fn object_key(&self) -> ObjectKey {
        ObjectKey::new(
            K::kind(&()).to_string(),
            self.identity_namespace(),
            self.name_any(),
        )
    }

    fn generation(&self) -> Option<i64> {
        self.meta().generation
    }

    fn is_being_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == VAULT_CLEANUP_FINALIZER)
    }

    fn identity_namespace(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }
}

/// Writes the reconciler makes back to the cluster
#[async_trait]
pub trait StatusSink<K>: Send + Sync {
    async fn add_finalizer(&self, obj: &K) -> Result<()>;

    async fn remove_finalizer(&self, obj: &K) -> Result<()>;

    async fn patch_status(&self, obj: &K, status: &RemoteObjectStatus) -> Result<()>;

    /// Best-effort Kubernetes event; sinks without an event channel ignore it
    async fn emit_event(&self, _obj: &K, _event_type: &str, _reason: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}
