//! Token Exchange Client
//!
//! Publishes and retrieves tokens through the shared store.
//!
//! ## Path scheme
//!
//! - keys published to a zone: `{mount}/metadata/{van}/{zone}/links`
//! - a single token: `{van}/{target_zone}/links/{source_zone}-{site_name}`

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::store::KvStore;
use crate::error::{Result, StoreError, VanFormError};
use crate::van::{Token, VanConfig, ZoneList};

/// Field holding the serialized token inside a published entry
pub const TOKEN_FIELD: &str = "token";

pub struct TokenExchange {
    store: Arc<dyn KvStore>,
    van: String,
    mount: String,
    zones: ZoneList,
    span: Span,
}

impl TokenExchange {
    pub fn new(store: Arc<dyn KvStore>, config: &VanConfig) -> Self {
        Self {
            store,
            van: config.van.clone(),
            mount: config.path.clone(),
            zones: config.zones.clone(),
            span: info_span!("exchange", van = %config.van, mount = %config.path),
        }
    }

    /// Logical path listing every key published to `target_zone`
    pub fn links_list_path(&self, target_zone: &str) -> String {
        format!("{}/metadata/{}/{}/links", self.mount, self.van, target_zone)
    }

    /// Mount-relative path of a single token
    pub fn link_path(&self, target_zone: &str, link_key: &str) -> String {
        format!("{}/{}/links/{}", self.van, target_zone, link_key)
    }

    pub fn link_key(site_name: &str, source_zone: &str) -> String {
        format!("{}-{}", source_zone, site_name)
    }

    /// Normalize, serialize and write a token. Last writer wins.
    pub async fn publish(&self, mut token: Token) -> Result<()> {
        token.prepare();
        let payload = token.marshal()?;
        let path = self.link_path(
            &token.target_zone,
            &Self::link_key(&token.site_name, &token.site_zone),
        );

        let mut data = Map::new();
        data.insert(TOKEN_FIELD.to_string(), Value::String(payload));

        let span = info_span!(
            parent: &self.span,
            "publish",
            path = %path,
            site_name = %token.site_name,
            target_zone = %token.target_zone
        );
        match self.store.put(&path, data).instrument(span.clone()).await {
            Ok(()) => {
                info!(parent: &span, "token published");
                Ok(())
            }
            Err(source) => {
                error!(parent: &span, error = %source, "error publishing token");
                Err(VanFormError::Publish { path, source })
            }
        }
    }

    /// Tokens published to any configured zone, excluding those produced
    /// by `self_site_name`.
    ///
    /// A zone whose listing fails is skipped, as is any entry that cannot
    /// be decoded.
    pub async fn list_available(&self, self_site_name: &str) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        for zone in &self.zones {
            let list_path = self.links_list_path(&zone.name);
            let span = info_span!(parent: &self.span, "zone", zone = %zone.name, path = %list_path);

            debug!(parent: &span, "getting available links");
            let keys = match self.store.list(&list_path).instrument(span.clone()).await {
                Ok(Some(keys)) => keys,
                Ok(None) => {
                    debug!(parent: &span, "no links found");
                    continue;
                }
                Err(e) => {
                    error!(parent: &span, error = %e, "unable to get links list");
                    continue;
                }
            };

            for key in keys {
                let path = self.link_path(&zone.name, &key);
                let entry_span = info_span!(parent: &span, "link", path = %path);
                if let Some(token) = self
                    .fetch_entry(&path)
                    .instrument(entry_span.clone())
                    .await?
                {
                    if token.site_name == self_site_name {
                        debug!(parent: &entry_span, "ignoring self-token");
                        continue;
                    }
                    debug!(parent: &entry_span, link = %token.link_name(), "link found");
                    tokens.push(token);
                }
            }
        }
        Ok(tokens)
    }

    /// Fetch one listed entry; `None` for entries that vanished or do not
    /// decode.
    async fn fetch_entry(&self, path: &str) -> Result<Option<Token>> {
        let data = match self.store.get(path).await {
            Ok(data) => data,
            Err(StoreError::NotFound { .. }) => {
                debug!("link vanished after listing");
                return Ok(None);
            }
            Err(source) => {
                error!(error = %source, "error getting link");
                return Err(VanFormError::Store {
                    path: path.to_string(),
                    source,
                });
            }
        };

        let Some(payload) = data.get(TOKEN_FIELD).and_then(Value::as_str) else {
            debug!("token key not found - possibly deleted");
            return Ok(None);
        };

        match Token::unmarshal(payload) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(error = %e, "skipping link that cannot be decoded");
                Ok(None)
            }
        }
    }

    /// The token `site_name` published from `source_zone` to `target_zone`.
    ///
    /// Returns `None` when nothing has been published yet.
    pub async fn get_published(
        &self,
        site_name: &str,
        source_zone: &str,
        target_zone: &str,
    ) -> Result<Option<Token>> {
        let path = self.link_path(target_zone, &Self::link_key(site_name, source_zone));
        let span = info_span!(
            parent: &self.span,
            "published",
            path = %path,
            source_zone = %source_zone,
            target_zone = %target_zone
        );

        debug!(parent: &span, "getting link");
        let data = match self.store.get(&path).instrument(span.clone()).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                debug!(parent: &span, "no published link found");
                return Ok(None);
            }
            Err(source) => {
                error!(parent: &span, error = %source, "error getting link");
                return Err(VanFormError::Store { path, source });
            }
        };

        let payload = data
            .get(TOKEN_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                error!(parent: &span, "token key not found");
                VanFormError::Decode(format!("token key not found for VAN {} at {}", self.van, path))
            })?;

        Token::unmarshal(payload).map(Some).map_err(|e| {
            error!(parent: &span, error = %e, "error unmarshalling token");
            e
        })
    }
}
