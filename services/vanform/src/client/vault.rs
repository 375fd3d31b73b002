//! Vault REST Client
//!
//! Thin wrapper over the Vault HTTP API covering what VAN Form needs:
//! AppRole login, token self-renewal and KV v2 list/get/put.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::approle::{AppRoleCredentials, AppRoleSession};
use super::store::{KvStore, StoreConnection, StoreConnector};
use crate::error::{Result, StoreError, VanFormError};
use crate::van::VanConfig;

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Authentication grant returned by login and renewal
#[derive(Clone, Deserialize)]
pub struct AuthLease {
    pub client_token: String,
    /// Lease length in seconds
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
}

impl fmt::Debug for AuthLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthLease")
            .field("client_token", &"<redacted>")
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .finish()
    }
}

/// Authentication endpoints used by the credential session
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn login(
        &self,
        auth_method_path: &str,
        role_id: &str,
        secret_id: &str,
    ) -> Result<AuthLease, StoreError>;

    async fn renew_self(&self, client_token: &str, increment: u64)
        -> Result<AuthLease, StoreError>;
}

#[derive(Deserialize)]
struct AuthResponse {
    auth: Option<AuthLease>,
}

#[derive(Deserialize)]
struct ListResponse {
    data: Option<ListData>,
}

#[derive(Deserialize)]
struct ListData {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct KvReadResponse {
    data: Option<KvReadData>,
}

#[derive(Deserialize)]
struct KvReadData {
    data: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

/// HTTP client for a single Vault address
#[derive(Clone)]
pub struct VaultClient {
    http: Client,
    address: String,
}

impl VaultClient {
    pub fn new(address: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("vanform/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VanFormError::Config(format!("error creating vault client: {}", e)))?;

        Ok(Self {
            http,
            address: address.trim_end_matches('/').to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/v1/{}", self.address, path))
    }

    /// Map non-success responses onto `StoreError`
    async fn check(path: &str, response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.errors.join("; "))
            .unwrap_or(body);
        Err(StoreError::Status {
            status: status.as_u16(),
            path: path.to_string(),
            message,
        })
    }

    async fn auth_lease(path: &str, response: Response) -> Result<AuthLease, StoreError> {
        let response = Self::check(path, response).await?;
        let body: AuthResponse = response.json().await?;
        body.auth.ok_or_else(|| StoreError::Malformed {
            path: path.to_string(),
            message: "response carries no auth block".to_string(),
        })
    }

    /// List keys under a logical path. A 404 means no keys.
    pub async fn list(&self, token: &str, logical_path: &str) -> Result<Option<Vec<String>>, StoreError> {
        debug!(path = %logical_path, "listing keys");
        let response = self
            .request(Method::GET, logical_path)
            .query(&[("list", "true")])
            .header(TOKEN_HEADER, token)
            .send()
            .await?;

        let response = match Self::check(logical_path, response).await {
            Ok(response) => response,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body: ListResponse = response.json().await?;
        Ok(body.data.map(|data| data.keys))
    }

    /// Read the latest version of a KV v2 secret
    pub async fn kv_get(
        &self,
        token: &str,
        mount: &str,
        path: &str,
    ) -> Result<Map<String, Value>, StoreError> {
        let full_path = format!("{}/data/{}", mount, path);
        let response = self
            .request(Method::GET, &full_path)
            .header(TOKEN_HEADER, token)
            .send()
            .await?;
        let response = Self::check(&full_path, response).await?;
        let body: KvReadResponse = response.json().await?;

        // Soft-deleted versions come back without data
        Ok(body.data.and_then(|d| d.data).unwrap_or_default())
    }

    /// Write a new version of a KV v2 secret
    pub async fn kv_put(
        &self,
        token: &str,
        mount: &str,
        path: &str,
        data: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let full_path = format!("{}/data/{}", mount, path);
        let response = self
            .request(Method::POST, &full_path)
            .header(TOKEN_HEADER, token)
            .json(&json!({ "data": data }))
            .send()
            .await?;
        Self::check(&full_path, response).await?;
        Ok(())
    }
}

#[async_trait]
impl AuthBackend for VaultClient {
    async fn login(
        &self,
        auth_method_path: &str,
        role_id: &str,
        secret_id: &str,
    ) -> Result<AuthLease, StoreError> {
        let path = format!("auth/{}/login", auth_method_path);
        debug!(path = %path, "Logging in using approle");
        let response = self
            .request(Method::POST, &path)
            .json(&json!({ "role_id": role_id, "secret_id": secret_id }))
            .send()
            .await?;
        Self::auth_lease(&path, response).await
    }

    async fn renew_self(
        &self,
        client_token: &str,
        increment: u64,
    ) -> Result<AuthLease, StoreError> {
        let path = "auth/token/renew-self";
        let response = self
            .request(Method::POST, path)
            .header(TOKEN_HEADER, client_token)
            .json(&json!({ "increment": increment }))
            .send()
            .await?;
        Self::auth_lease(path, response).await
    }
}

/// `KvStore` backed by Vault, using the session's current client token
pub struct VaultKv {
    client: VaultClient,
    session: Arc<AppRoleSession>,
    mount: String,
}

impl VaultKv {
    pub fn new(client: VaultClient, session: Arc<AppRoleSession>, mount: impl Into<String>) -> Self {
        Self {
            client,
            session,
            mount: mount.into(),
        }
    }

    async fn token(&self) -> Result<String, StoreError> {
        self.session
            .client_token()
            .await
            .ok_or(StoreError::Unauthenticated)
    }
}

#[async_trait]
impl KvStore for VaultKv {
    async fn list(&self, logical_path: &str) -> Result<Option<Vec<String>>, StoreError> {
        let token = self.token().await?;
        self.client.list(&token, logical_path).await
    }

    async fn get(&self, path: &str) -> Result<Map<String, Value>, StoreError> {
        let token = self.token().await?;
        self.client.kv_get(&token, &self.mount, path).await
    }

    async fn put(&self, path: &str, data: Map<String, Value>) -> Result<(), StoreError> {
        let token = self.token().await?;
        self.client.kv_put(&token, &self.mount, path, data).await
    }
}

/// Connects to the Vault server named in the VAN configuration
#[derive(Debug, Default, Clone, Copy)]
pub struct VaultConnector;

impl StoreConnector for VaultConnector {
    fn connect(
        &self,
        config: &VanConfig,
        credentials: AppRoleCredentials,
    ) -> Result<StoreConnection> {
        let client = VaultClient::new(&config.url)?;
        let session = Arc::new(
            AppRoleSession::new(Arc::new(client.clone()))
                .with_credentials(credentials)
                .for_van(&config.van),
        );
        let store = Arc::new(VaultKv::new(client, session.clone(), config.path.clone()));
        Ok(StoreConnection { session, store })
    }
}
