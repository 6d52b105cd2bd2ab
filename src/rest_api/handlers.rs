//! HTTP handlers for the REST API

use std::fmt::Debug;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use k8s_openapi::NamespaceResourceScope;
use kube::{api::Api, Resource};
use serde::de::DeserializeOwned;
use tracing::{error, instrument};

use crate::controller::conditions::{find_condition, CONDITION_TYPE_READY};
use crate::controller::{ConditionsAware, ControllerState, ManagedObject};
use crate::crd::{DatabaseSecretEngineRole, DatabaseSecretEngineStaticRole, KubernetesAuthEngineRole};

use super::dto::{ErrorResponse, HealthResponse, ResourceListResponse, ResourceSummary};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ControllerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.is_leader(),
    })
}

pub fn summarize<K: ManagedObject>(obj: &K) -> ResourceSummary {
    let key = obj.object_key();
    ResourceSummary {
        kind: key.kind,
        namespace: key.namespace,
        name: key.name,
        ready: obj.is_ready(),
        observed_generation: obj.remote_status().and_then(|s| s.observed_generation),
        message: find_condition(obj.conditions(), CONDITION_TYPE_READY).map(|c| c.message.clone()),
    }
}

async fn list_kind<K>(state: &ControllerState) -> Result<Vec<ResourceSummary>, ApiError>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ManagedObject
        + Clone
        + DeserializeOwned
        + Debug,
{
    let api: Api<K> = match state.settings.watch_namespace.as_deref() {
        Some(ns) => Api::namespaced(state.client.clone(), ns),
        None => Api::all(state.client.clone()),
    };
    match api.list(&Default::default()).await {
        Ok(list) => Ok(list.items.iter().map(summarize).collect()),
        Err(e) => {
            error!("Failed to list {}: {:?}", K::kind(&()), e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "list_failed".to_string(),
                    message: e.to_string(),
                }),
            ))
        }
    }
}

/// List every managed resource with its readiness
#[instrument(skip(state))]
pub async fn list_resources(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<ResourceListResponse>, ApiError> {
    let mut items = list_kind::<DatabaseSecretEngineStaticRole>(&state).await?;
    items.extend(list_kind::<DatabaseSecretEngineRole>(&state).await?);
    items.extend(list_kind::<KubernetesAuthEngineRole>(&state).await?);

    let total = items.len();
    Ok(Json(ResourceListResponse { items, total }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::conditions::{ready_condition, REASON_RECONCILED};
    use crate::crd::{DatabaseSecretEngineRoleSpec, RemoteObjectStatus};

    #[test]
    fn test_summarize_reports_ready_condition() {
        let mut role = DatabaseSecretEngineRole::new(
            "reader",
            DatabaseSecretEngineRoleSpec {
                authentication: Default::default(),
                path: "database".to_string(),
                db_name: "app".to_string(),
                default_ttl: None,
                max_ttl: None,
                creation_statements: vec!["CREATE ROLE".to_string()],
                revocation_statements: vec![],
                rollback_statements: vec![],
                renew_statements: vec![],
            },
        );
        role.metadata.namespace = Some("team-a".to_string());
        role.status = Some(RemoteObjectStatus {
            conditions: vec![ready_condition(REASON_RECONCILED, "Created database/roles/reader")],
            observed_generation: Some(3),
        });

        let summary = summarize(&role);
        assert_eq!(summary.kind, "DatabaseSecretEngineRole");
        assert_eq!(summary.namespace, "team-a");
        assert!(summary.ready);
        assert_eq!(summary.observed_generation, Some(3));
        assert_eq!(
            summary.message.as_deref(),
            Some("Created database/roles/reader")
        );
    }
}
