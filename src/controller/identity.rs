//! Service-account identity tokens for Vault's Kubernetes auth method

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

use crate::error::{Error, Result};

/// Source of a short-lived JWT proving a service account's identity
#[async_trait]
pub trait IdentityTokenSource: Send + Sync {
    async fn service_account_token(&self, namespace: &str, service_account: &str)
        -> Result<String>;
}

/// Issues projected tokens through the TokenRequest subresource
pub struct KubeTokenRequest {
    client: Client,
    expiration_seconds: i64,
}

impl KubeTokenRequest {
    pub fn new(client: Client, expiration_seconds: i64) -> Self {
        Self {
            client,
            expiration_seconds,
        }
    }
}

#[async_trait]
impl IdentityTokenSource for KubeTokenRequest {
    async fn service_account_token(
        &self,
        namespace: &str,
        service_account: &str,
    ) -> Result<String> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let request = TokenRequest {
            spec: TokenRequestSpec {
                expiration_seconds: Some(self.expiration_seconds),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = api
            .create_token_request(service_account, &PostParams::default(), &request)
            .await
            .map_err(|e| match e {
                kube::Error::Api(resp) if resp.code == 403 || resp.code == 404 => {
                    Error::AuthRejected(format!(
                        "cannot request a token for service account {namespace}/{service_account}: {}",
                        resp.message
                    ))
                }
                other => Error::KubeError(other),
            })?;

        debug!(namespace, service_account, "Issued service account token");
        response
            .status
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Transient(format!(
                    "token request for {namespace}/{service_account} returned no token"
                ))
            })
    }
}
