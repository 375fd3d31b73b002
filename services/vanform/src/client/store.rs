//! Key-value store seam
//!
//! The token exchange only needs list/get/put against a KV v2 style store.
//! `VaultKv` implements this over the Vault REST API; tests use an
//! in-memory store.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::approle::{AppRoleCredentials, AppRoleSession};
use crate::error::{Result, StoreError};
use crate::van::VanConfig;

/// Versioned key-value store addressed by hierarchical paths
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Keys under a logical metadata path (`{mount}/metadata/...`).
    ///
    /// Returns `None` when nothing has been stored under the path.
    async fn list(&self, logical_path: &str) -> Result<Option<Vec<String>>, StoreError>;

    /// Latest data stored at a mount-relative path.
    ///
    /// Fails with [`StoreError::NotFound`] when the path holds nothing.
    async fn get(&self, path: &str) -> Result<Map<String, Value>, StoreError>;

    /// Write data at a mount-relative path, replacing any previous value
    async fn put(&self, path: &str, data: Map<String, Value>) -> Result<(), StoreError>;
}

/// An authenticated-on-demand session and the store bound to it
#[derive(Clone)]
pub struct StoreConnection {
    pub session: Arc<AppRoleSession>,
    pub store: Arc<dyn KvStore>,
}

/// Builds store connections from the instance configuration
pub trait StoreConnector: Send + Sync {
    /// Create a connection whose session has not logged in yet
    fn connect(&self, config: &VanConfig, credentials: AppRoleCredentials)
        -> Result<StoreConnection>;
}
