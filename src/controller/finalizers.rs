//! Finalizer and status writes against the Kubernetes API
//!
//! The finalizer guarantees that a deleted resource is removed from Vault
//! before Kubernetes lets the object go. Finalizer writes are JSON patches
//! with a `test` on the list as it was read, so another controller's
//! finalizer is never overwritten.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::object::StatusSink;
use crate::crd::RemoteObjectStatus;
use crate::error::{Error, Result};

/// Finalizer guarding remote cleanup
pub const VAULT_CLEANUP_FINALIZER: &str = "redhatcop.redhat.io/vault-cleanup";

/// Field manager recorded on every patch
pub const FIELD_MANAGER: &str = "vault-config-operator";

/// [`StatusSink`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStatusSink {
    client: Client,
}

impl KubeStatusSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, obj: &K) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }

    /// Send a guarded finalizer patch; a failed `test` means the list moved
    async fn send_finalizer_patch<K>(&self, obj: &K, patch: json_patch::Patch) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        match self
            .api(obj)
            .patch(&obj.name_any(), &PatchParams::default(), &Patch::<()>::Json(patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 422 => Err(Error::Transient(format!(
                "finalizers of {}/{} changed concurrently: {}",
                K::kind(&()),
                obj.name_any(),
                resp.message
            ))),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

/// JSON patch appending the cleanup finalizer, guarded by a `test` on the
/// list as last seen; `None` when it is already present
pub fn add_finalizer_patch(current: &[String]) -> Result<Option<json_patch::Patch>> {
    if current.iter().any(|f| f == VAULT_CLEANUP_FINALIZER) {
        return Ok(None);
    }
    let ops = if current.is_empty() {
        // An absent list cannot be appended to
        json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": [VAULT_CLEANUP_FINALIZER] },
        ])
    } else {
        json!([
            { "op": "test", "path": "/metadata/finalizers", "value": current },
            { "op": "add", "path": "/metadata/finalizers/-", "value": VAULT_CLEANUP_FINALIZER },
        ])
    };
    Ok(Some(serde_json::from_value(ops)?))
}

/// JSON patch removing the cleanup finalizer at its index, guarded by a
/// `test` on that entry; `None` when it is absent
pub fn remove_finalizer_patch(current: &[String]) -> Result<Option<json_patch::Patch>> {
    let Some(index) = current.iter().position(|f| f == VAULT_CLEANUP_FINALIZER) else {
        return Ok(None);
    };
    let path = format!("/metadata/finalizers/{index}");
    let ops = json!([
        { "op": "test", "path": path, "value": VAULT_CLEANUP_FINALIZER },
        { "op": "remove", "path": path },
    ]);
    Ok(Some(serde_json::from_value(ops)?))
}

#[async_trait]
impl<K> StatusSink<K> for KubeStatusSink
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn add_finalizer(&self, obj: &K) -> Result<()> {
        let Some(patch) = add_finalizer_patch(obj.finalizers())? else {
            return Ok(());
        };
        self.send_finalizer_patch(obj, patch).await?;
        info!("Added finalizer to {}/{}", K::kind(&()), obj.name_any());
        Ok(())
    }

    async fn remove_finalizer(&self, obj: &K) -> Result<()> {
        let Some(patch) = remove_finalizer_patch(obj.finalizers())? else {
            return Ok(());
        };
        match self.send_finalizer_patch(obj, patch).await {
            Ok(()) => {}
            // Already gone: nothing left to release
            Err(Error::KubeError(kube::Error::Api(resp))) if resp.code == 404 => {}
            Err(e) => return Err(e),
        }

        info!("Removed finalizer from {}/{}", K::kind(&()), obj.name_any());
        Ok(())
    }

    async fn patch_status(&self, obj: &K, status: &RemoteObjectStatus) -> Result<()> {
        let patch = json!({ "status": status });
        self.api(obj)
            .patch_status(
                &obj.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(Error::KubeError)?;
        debug!("Patched status of {}/{}", K::kind(&()), obj.name_any());
        Ok(())
    }

    async fn emit_event(&self, obj: &K, event_type: &str, reason: &str, message: &str) -> Result<()> {
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", obj.name_any())),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: obj.object_ref(&()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        events
            .create(&PostParams::default(), &event)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(patch: json_patch::Patch) -> serde_json::Value {
        serde_json::to_value(patch).unwrap()
    }

    #[test]
    fn test_finalizer_name() {
        assert_eq!(VAULT_CLEANUP_FINALIZER, "redhatcop.redhat.io/vault-cleanup");
    }

    #[test]
    fn test_add_to_empty_list_tests_for_absence() {
        let patch = add_finalizer_patch(&[]).unwrap().unwrap();
        assert_eq!(
            ops(patch),
            json!([
                { "op": "test", "path": "/metadata/finalizers", "value": null },
                { "op": "add", "path": "/metadata/finalizers", "value": [VAULT_CLEANUP_FINALIZER] },
            ])
        );
    }

    #[test]
    fn test_add_keeps_other_finalizers_and_guards_the_list() {
        let current = vec!["example.com/other".to_string()];
        let patch = add_finalizer_patch(&current).unwrap().unwrap();
        assert_eq!(
            ops(patch),
            json!([
                { "op": "test", "path": "/metadata/finalizers", "value": ["example.com/other"] },
                { "op": "add", "path": "/metadata/finalizers/-", "value": VAULT_CLEANUP_FINALIZER },
            ])
        );
    }

    #[test]
    fn test_add_is_noop_when_present() {
        let current = vec![VAULT_CLEANUP_FINALIZER.to_string()];
        assert!(add_finalizer_patch(&current).unwrap().is_none());
    }

    #[test]
    fn test_remove_targets_only_our_entry() {
        let current = vec![
            "example.com/other".to_string(),
            VAULT_CLEANUP_FINALIZER.to_string(),
        ];
        let patch = remove_finalizer_patch(&current).unwrap().unwrap();
        assert_eq!(
            ops(patch),
            json!([
                { "op": "test", "path": "/metadata/finalizers/1", "value": VAULT_CLEANUP_FINALIZER },
                { "op": "remove", "path": "/metadata/finalizers/1" },
            ])
        );
        assert!(remove_finalizer_patch(&current[..1]).unwrap().is_none());
    }
}
