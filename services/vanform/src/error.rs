//! Error taxonomy
//!
//! Errors are split by how far they propagate: item-level failures
//! (one zone listing, one decode, one local create/delete) are logged and
//! contained, while pass-level failures (login, config, generation,
//! publish) abort the current reconciliation pass.

use thiserror::Error;

/// Errors raised by the shared key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Nothing is stored at the requested path
    #[error("not found: {path}")]
    NotFound { path: String },

    /// The session holds no valid client token
    #[error("store session is not authenticated")]
    Unauthenticated,

    /// The store answered with an unexpected status
    #[error("store returned {status} for {path}: {message}")]
    Status {
        status: u16,
        path: String,
        message: String,
    },

    /// The store response could not be interpreted
    #[error("malformed store response for {path}: {message}")]
    Malformed { path: String, message: String },

    /// Transport level failure
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl StoreError {
    /// Structured "not found" indicator, distinct from genuine fetch failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Errors surfaced by the VAN Form core.
#[derive(Debug, Error)]
pub enum VanFormError {
    /// Session could not be established
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Publishing a token failed
    #[error("error publishing token at {path}: {source}")]
    Publish {
        path: String,
        #[source]
        source: StoreError,
    },

    /// Reading from the shared store failed
    #[error("error reading {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: StoreError,
    },

    /// A token payload could not be decoded
    #[error("unable to decode token: {0}")]
    Decode(String),

    /// The local resource backend failed
    #[error("backend error: {0:#}")]
    Backend(anyhow::Error),

    /// The configuration object is missing or malformed
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_yaml::Error> for VanFormError {
    fn from(err: serde_yaml::Error) -> Self {
        VanFormError::Decode(err.to_string())
    }
}

pub type Result<T, E = VanFormError> = std::result::Result<T, E>;
