//! Registry holding one dispatcher per platform.

use crate::config::{EngineConfig, PlatformSettings};
use crate::connector::{self, Connector};
use crate::pipeline::{Dispatcher, DispatcherStats};
use crate::sinks::{AuditSink, NoopAuditSink};
use bid_core::{BidRequest, BidResponse, Clock, ConfigError, Platform, RejectReason};
use dashmap::DashMap;
use std::sync::Arc;
use telemetry::{MetricsSink, NoopMetrics};
use tokio::time::Instant;
use tracing::info;

/// Routes each request to its platform's dispatcher.
#[derive(Clone)]
pub struct BidEngine {
    dispatchers: Arc<DashMap<Platform, Arc<Dispatcher>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BidEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BidEngine").field("platforms", &self.platforms()).finish()
    }
}

impl BidEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { dispatchers: Arc::new(DashMap::new()), clock }
    }

    /// Build one dispatcher per configured platform. `connector_for` supplies each
    /// platform's connector.
    pub fn from_config<F>(
        cfg: &EngineConfig,
        clock: Arc<dyn Clock>,
        mut connector_for: F,
        metrics: Arc<dyn MetricsSink>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError>
    where
        F: FnMut(&PlatformSettings) -> Arc<dyn Connector>,
    {
        let engine = Self::new(Arc::clone(&clock));
        for settings in cfg.platform_settings()? {
            let conn = connector_for(&settings);
            let d = Dispatcher::new(settings, conn, Arc::clone(&clock))?
                .with_metrics(Arc::clone(&metrics))
                .with_audit(Arc::clone(&audit));
            engine.register(d)?;
        }
        info!(platforms = engine.dispatchers.len(), "bid engine ready");
        Ok(engine)
    }

    /// [`from_config`](Self::from_config) with the connector the config names.
    pub fn from_config_default(
        cfg: &EngineConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        let spec = cfg.connector.clone();
        Self::from_config(cfg, clock, |s| connector::build(s.platform, &spec), metrics, audit)
    }

    pub fn register(&self, dispatcher: Dispatcher) -> Result<Arc<Dispatcher>, ConfigError> {
        let platform = dispatcher.platform();
        if self.dispatchers.contains_key(&platform) {
            return Err(ConfigError::DuplicatePlatform(platform.to_string()));
        }
        let d = Arc::new(dispatcher);
        self.dispatchers.insert(platform, Arc::clone(&d));
        Ok(d)
    }

    pub fn dispatcher(&self, platform: Platform) -> Option<Arc<Dispatcher>> {
        self.dispatchers.get(&platform).map(|d| Arc::clone(d.value()))
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut out: Vec<Platform> = self.dispatchers.iter().map(|e| *e.key()).collect();
        out.sort();
        out
    }

    pub fn stats(&self) -> Vec<DispatcherStats> {
        self.platforms()
            .into_iter()
            .filter_map(|p| self.dispatcher(p))
            .map(|d| d.stats())
            .collect()
    }

    fn unrouted(&self, req: &BidRequest) -> BidResponse {
        BidResponse::rejected(
            RejectReason::Validation,
            format!("no dispatcher configured for {}", req.platform),
            self.clock.now_ms(),
        )
    }

    pub async fn submit(&self, req: &BidRequest) -> BidResponse {
        // Clone the Arc out so no map guard is held across the await.
        match self.dispatcher(req.platform) {
            Some(d) => d.submit(req).await,
            None => self.unrouted(req),
        }
    }

    pub async fn submit_with_deadline(&self, req: &BidRequest, deadline: Instant) -> BidResponse {
        match self.dispatcher(req.platform) {
            Some(d) => d.submit_with_deadline(req, deadline).await,
            None => self.unrouted(req),
        }
    }

    /// Connect every platform connector. Returns the platforms that failed.
    pub async fn connect_all(&self) -> Vec<(Platform, bid_core::PlatformError)> {
        let mut failed = Vec::new();
        for d in self.platforms().into_iter().filter_map(|p| self.dispatcher(p)) {
            if let Err(e) = d.connector().connect().await {
                failed.push((d.platform(), e));
            }
        }
        failed
    }

    pub async fn close_all(&self) {
        for d in self.platforms().into_iter().filter_map(|p| self.dispatcher(p)) {
            d.connector().close().await;
        }
    }
}

impl Default for BidEngine {
    fn default() -> Self {
        Self::new(Arc::new(bid_core::SystemClock))
    }
}

/// Engine with no-op sinks; convenient for tests and tools.
pub fn engine_without_sinks(
    cfg: &EngineConfig,
    clock: Arc<dyn Clock>,
) -> Result<BidEngine, ConfigError> {
    BidEngine::from_config_default(cfg, clock, Arc::new(NoopMetrics), Arc::new(NoopAuditSink))
}
