//! HTTP client for the Vault API
//!
//! Every call carries a per-request deadline. HTTP status codes are mapped
//! onto the crate error taxonomy so the reconciler can decide between
//! retrying, evicting the token and failing terminally.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{DeleteOutcome, LoginResponse, Payload, VaultApi, VaultPath, VaultToken};
use crate::error::{Error, Result};

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Vault HTTP API client
#[derive(Clone, Debug)]
pub struct VaultClient {
    http: Client,
    address: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    data: Option<Payload>,
}

#[derive(Debug, Deserialize)]
struct LoginEnvelope {
    auth: Option<AuthBlock>,
}

#[derive(Debug, Deserialize)]
struct AuthBlock {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

impl VaultClient {
    /// Create a client for the Vault server at `address` (e.g. `https://vault:8200`)
    pub fn new(address: impl Into<String>, timeout: Duration) -> Result<Self> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(Error::ConfigError("Vault address is empty".to_string()));
        }
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            address: address.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&VaultToken>,
        namespace: Option<&str>,
    ) -> RequestBuilder {
        let url = format!("{}/v1/{}", self.address, path.trim_start_matches('/'));
        let mut request = self.http.request(method, url).timeout(self.timeout);
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token.expose());
        }
        if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
            request = request.header(NAMESPACE_HEADER, ns);
        }
        request
    }

    async fn send(
        &self,
        operation: &'static str,
        path: &str,
        request: RequestBuilder,
    ) -> Result<Response> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    operation,
                    path: path.to_string(),
                    timeout: self.timeout,
                }
            } else if e.is_connect() || e.is_request() {
                Error::Transient(format!("{operation} on {path}: {e}"))
            } else {
                Error::HttpError(e)
            }
        })
    }
}

/// Map a non-success response onto the error taxonomy
async fn error_from_response(operation: &'static str, path: &str, response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .filter(|b| !b.errors.is_empty())
        .map(|b| b.errors.join("; "))
        .unwrap_or_else(|| format!("HTTP {status}"));

    classify_status(operation, path, status, message)
}

fn classify_status(operation: &'static str, path: &str, status: StatusCode, message: String) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::AuthRejected(format!("{operation} on {path}: {message}"))
        }
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Error::Conflict(path.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::RemoteValidation {
            path: path.to_string(),
            message,
        },
        // A missing mount can appear later; keep retrying
        StatusCode::NOT_FOUND => {
            Error::Transient(format!("{operation} on {path}: no handler ({message})"))
        }
        _ => Error::Transient(format!("{operation} on {path}: {status}: {message}")),
    }
}

#[async_trait]
impl VaultApi for VaultClient {
    #[instrument(skip_all, fields(mount = %mount, role = %role))]
    async fn login(
        &self,
        mount: &str,
        role: &str,
        jwt: &str,
        namespace: Option<&str>,
    ) -> Result<LoginResponse> {
        let path = format!("auth/{}/login", mount.trim_matches('/'));
        let request = self
            .request(Method::POST, &path, None, namespace)
            .json(&json!({ "role": role, "jwt": jwt }));
        let response = self.send("login", &path, request).await?;

        let status = response.status();
        if !status.is_success() {
            // Vault answers 400 for an unknown role or an invalid JWT
            return Err(match error_from_response("login", &path, response).await {
                Error::RemoteValidation { message, .. } => {
                    Error::AuthRejected(format!("login at {path}: {message}"))
                }
                other => other,
            });
        }

        let envelope: LoginEnvelope = response.json().await?;
        let auth = envelope.auth.ok_or_else(|| {
            Error::AuthRejected(format!("login at {path} returned no auth block"))
        })?;

        debug!(ttl = auth.lease_duration, "Vault login succeeded");
        Ok(LoginResponse {
            token: VaultToken::new(auth.client_token, namespace.map(str::to_string)),
            ttl: Duration::from_secs(auth.lease_duration),
            renewable: auth.renewable,
        })
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn read(&self, token: &VaultToken, path: &VaultPath) -> Result<Option<Payload>> {
        let request = self.request(Method::GET, path.as_str(), Some(token), token.namespace());
        let response = self.send("read", path.as_str(), request).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: ReadResponse = response.json().await?;
                Ok(Some(body.data.unwrap_or_default()))
            }
            _ => Err(error_from_response("read", path.as_str(), response).await),
        }
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn write(&self, token: &VaultToken, path: &VaultPath, payload: &Payload) -> Result<()> {
        let request = self
            .request(Method::POST, path.as_str(), Some(token), token.namespace())
            .json(payload);
        let response = self.send("write", path.as_str(), request).await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response("write", path.as_str(), response).await)
        }
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn delete(&self, token: &VaultToken, path: &VaultPath) -> Result<DeleteOutcome> {
        let request = self.request(Method::DELETE, path.as_str(), Some(token), token.namespace());
        let response = self.send("delete", path.as_str(), request).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::NotFound),
            status if status.is_success() => Ok(DeleteOutcome::Deleted),
            _ => Err(error_from_response("delete", path.as_str(), response).await),
        }
    }
}
