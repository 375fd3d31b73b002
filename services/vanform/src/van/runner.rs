//! Reconciliation loop for one managed zone instance

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handler::SiteResolver;
use super::vanform::VanForm;

/// Time between two reconciliation passes
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

pub struct VanFormRunner {
    engine: Arc<VanForm>,
    sites: Arc<dyn SiteResolver>,
    interval: Duration,
}

impl VanFormRunner {
    pub fn new(engine: Arc<VanForm>, sites: Arc<dyn SiteResolver>) -> Self {
        Self {
            engine,
            sites,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run a pass immediately, then on every tick, until `cancel` fires.
    ///
    /// A pass in progress is never interrupted; cancellation is observed
    /// between passes. Returns the number of passes attempted.
    pub async fn run(self, cancel: CancellationToken) -> usize {
        info!(interval_secs = self.interval.as_secs(), "Starting VAN Form");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            passes += 1;
            self.run_pass().await;
        }

        info!(passes, "Stopping VAN Form");
        self.engine.shutdown().await;
        passes
    }

    async fn run_pass(&self) {
        let site_name = match self.sites.site_name().await {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Site is not ready, skipping pass");
                return;
            }
        };

        if let Err(e) = self.engine.process(&site_name).await {
            error!(site = %site_name, error = %e, "Reconciliation pass failed");
        }
    }
}
