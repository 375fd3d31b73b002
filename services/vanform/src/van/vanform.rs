//! Reconciliation Engine
//!
//! One pass publishes the tokens this instance makes available to other
//! zones, then materializes the tokens other sites published for it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::handler::{ConfigLoader, TokenHandler};
use super::token::Token;
use super::types::{VanConfig, ZoneList};
use crate::client::{AppRoleCredentials, StoreConnection, StoreConnector, TokenExchange};
use crate::error::{Result, VanFormError};

/// Counters reported for each pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Tokens written to the shared store
    pub published: usize,
    /// Generated tokens already published unchanged
    pub unchanged: usize,
    pub created: usize,
    pub deleted: usize,
    /// Local creates or deletes that failed
    pub failed: usize,
}

/// Local changes computed by the consume phase
#[derive(Debug, Default)]
struct ConsumePlan {
    delete: Vec<Token>,
    create: Vec<Token>,
}

impl ConsumePlan {
    fn build(zones: &ZoneList, existing: Vec<Token>, available: Vec<Token>) -> Self {
        let by_name: HashMap<&str, &Token> =
            available.iter().map(|t| (t.link_name(), t)).collect();
        let mut plan = ConsumePlan::default();

        for local in &existing {
            match by_name.get(local.link_name()) {
                None => {
                    debug!(link = %local.link_name(), "link no longer available");
                    plan.delete.push(local.clone());
                }
                Some(_) if !zones.has_zone(&local.target_zone) => {
                    debug!(
                        link = %local.link_name(),
                        target_zone = %local.target_zone,
                        "link targets a zone outside of the topology"
                    );
                    plan.delete.push(local.clone());
                }
                Some(remote) if *remote != local => {
                    debug!(link = %local.link_name(), "link has changed");
                    plan.delete.push(local.clone());
                    plan.create.push((*remote).clone());
                }
                Some(_) => {}
            }
        }

        let mut known: HashSet<String> =
            existing.iter().map(|t| t.link_name().to_string()).collect();
        for remote in available {
            if known.insert(remote.link_name().to_string()) {
                plan.create.push(remote);
            }
        }
        plan
    }
}

struct CachedConnection {
    url: String,
    mount: String,
    credentials: AppRoleCredentials,
    connection: StoreConnection,
}

impl CachedConnection {
    fn serves(&self, config: &VanConfig, credentials: &AppRoleCredentials) -> bool {
        self.url == config.url && self.mount == config.path && &self.credentials == credentials
    }
}

/// Reconciliation engine for one managed zone instance
pub struct VanForm {
    config_loader: Arc<dyn ConfigLoader>,
    token_handler: Arc<dyn TokenHandler>,
    connector: Arc<dyn StoreConnector>,
    connection: Mutex<Option<CachedConnection>>,
    cancel: CancellationToken,
}

impl VanForm {
    pub fn new(
        config_loader: Arc<dyn ConfigLoader>,
        token_handler: Arc<dyn TokenHandler>,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        Self {
            config_loader,
            token_handler,
            connector,
            connection: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Run one publish + consume pass on behalf of `site_name`
    pub async fn process(&self, site_name: &str) -> Result<PassSummary> {
        let (config, secret) = self
            .config_loader
            .load_config()
            .await
            .map_err(|e| VanFormError::Config(format!("unable to load configuration: {:#}", e)))?;
        config.validate()?;
        let credentials = AppRoleCredentials::from_secret(&secret)?;

        let span = info_span!("van_form", van = %config.van, site = %site_name);
        async {
            let connection = self.connect(&config, credentials).await?;
            let exchange = TokenExchange::new(connection.store.clone(), &config);

            let mut summary = PassSummary::default();
            self.publish_tokens(&config, &exchange, &mut summary).await?;
            self.consume_tokens(&config, &exchange, site_name, &mut summary)
                .await?;

            info!(
                published = summary.published,
                unchanged = summary.unchanged,
                created = summary.created,
                deleted = summary.deleted,
                failed = summary.failed,
                "pass complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Reuse the cached session when it still serves the configuration,
    /// logging in again if it lost authentication.
    async fn connect(
        &self,
        config: &VanConfig,
        credentials: AppRoleCredentials,
    ) -> Result<StoreConnection> {
        let mut cached = self.connection.lock().await;

        if let Some(existing) = cached.as_ref() {
            if existing.serves(config, &credentials) {
                if !existing.connection.session.is_authenticated().await {
                    info!("store session is not authenticated, logging in");
                    existing.connection.session.login(&self.cancel).await?;
                }
                return Ok(existing.connection.clone());
            }
        }

        if let Some(stale) = cached.take() {
            info!("store configuration changed, replacing session");
            stale.connection.session.logout().await;
        }

        let connection = self.connector.connect(config, credentials.clone())?;
        connection.session.login(&self.cancel).await?;
        info!(url = %config.url, mount = %config.path, "logged into store");

        *cached = Some(CachedConnection {
            url: config.url.clone(),
            mount: config.path.clone(),
            credentials,
            connection: connection.clone(),
        });
        Ok(connection)
    }

    async fn publish_tokens(
        &self,
        config: &VanConfig,
        exchange: &TokenExchange,
        summary: &mut PassSummary,
    ) -> Result<()> {
        if !config.zones.reachable() {
            debug!("no reachable zones, nothing to publish");
            return Ok(());
        }

        let tokens = self
            .token_handler
            .generate(config)
            .await
            .map_err(VanFormError::Backend)?;

        for token in tokens {
            let span = info_span!(
                "publish",
                link = %token.link_name(),
                site_zone = %token.site_zone,
                target_zone = %token.target_zone
            );
            let published = exchange
                .get_published(&token.site_name, &token.site_zone, &token.target_zone)
                .instrument(span.clone())
                .await;
            match published {
                Ok(Some(current)) if current == token => {
                    debug!(parent: &span, "token already published");
                    summary.unchanged += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(parent: &span, error = %e, "unable to read published token, publishing anyway");
                }
            }
            exchange.publish(token).instrument(span).await?;
            summary.published += 1;
        }
        Ok(())
    }

    async fn consume_tokens(
        &self,
        config: &VanConfig,
        exchange: &TokenExchange,
        site_name: &str,
        summary: &mut PassSummary,
    ) -> Result<()> {
        let existing = self
            .token_handler
            .load()
            .await
            .map_err(VanFormError::Backend)?;
        let available = exchange.list_available(site_name).await?;
        debug!(
            existing = existing.len(),
            available = available.len(),
            "computing local changes"
        );

        let plan = ConsumePlan::build(&config.zones, existing, available);

        // Deletions first so a recreated link never collides with its old self
        for token in &plan.delete {
            match self.token_handler.delete(token).await {
                Ok(()) => {
                    info!(link = %token.link_name(), "link deleted");
                    summary.deleted += 1;
                }
                Err(e) => {
                    error!(link = %token.link_name(), error = %format!("{:#}", e), "error deleting link");
                    summary.failed += 1;
                }
            }
        }
        for token in plan.create {
            let name = token.link_name().to_string();
            match self.token_handler.save(token).await {
                Ok(()) => {
                    info!(link = %name, "link created");
                    summary.created += 1;
                }
                Err(e) => {
                    error!(link = %name, error = %format!("{:#}", e), "error creating link");
                    summary.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Stop session renewal and drop the cached session
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(cached) = self.connection.lock().await.take() {
            cached.connection.session.logout().await;
        }
    }
}
