//! Platform collaborators
//!
//! Backends (Kubernetes, local filesystem) implement these traits to let
//! the reconciliation engine read and write local resources.

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;

use super::token::Token;
use super::types::VanConfig;

/// Local resource backend for tokens
#[async_trait]
pub trait TokenHandler: Send + Sync {
    /// Local tokens carrying the VAN Form provenance label
    async fn load(&self) -> Result<Vec<Token>>;

    /// Normalize and persist a token's link and secret. Must succeed when
    /// the resources already exist.
    async fn save(&self, token: Token) -> Result<()>;

    /// Desired token set for the current topology; empty when no zone is
    /// reachable.
    async fn generate(&self, config: &VanConfig) -> Result<Vec<Token>>;

    /// Remove the link, and the secret unless another local token still
    /// references it.
    async fn delete(&self, token: &Token) -> Result<()>;
}

/// Source of the VAN configuration and store credentials for one instance
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    /// The topology plus the secret holding the store credentials
    async fn load_config(&self) -> Result<(VanConfig, Secret)>;
}

/// Resolves the name of the ready local site before each pass
#[async_trait]
pub trait SiteResolver: Send + Sync {
    async fn site_name(&self) -> Result<String>;
}

/// Whether a credential bundle is referenced by a surviving local token
/// other than `token` itself.
pub fn secret_still_referenced(token: &Token, existing: &[Token]) -> bool {
    let secret_name = token.secret_name();
    existing.iter().any(|other| {
        other.secret_name() == secret_name && other.link_name() != token.link_name()
    })
}
