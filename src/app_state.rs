// =============================================================================
// Engine assembly — ties every subsystem together
// =============================================================================
//
// The single construction point for the object graph, in strict leaf-first
// order: store and audit first, then sources, then the distributor, then the
// generator on top. Subsystems own their state behind Arcs; nothing holds a
// back-reference to the generator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::HealthState;
use crate::audit::AuditLog;
use crate::config::{Config, Secrets};
use crate::distributor::{Distributor, RecoverableRejection};
use crate::executor::{ExecutorService, SimBroker};
use crate::generator::SignalGenerator;
use crate::metrics::Metrics;
use crate::quality::Calibrator;
use crate::regime::RegimeDetector;
use crate::rejected::RejectedSignalQueue;
use crate::sources::market_data::{FallbackFeed, MarketDataFeed, SimMarketFeed};
use crate::sources::sim::SimSource;
use crate::sources::{DataSource, SourceRegistry};
use crate::store::SignalStore;
use crate::sync::AlpineSync;

/// Default account equity for the development broker.
const DEV_STARTING_EQUITY: f64 = 100_000.0;

pub struct AppState {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub store: Arc<SignalStore>,
    pub audit: Arc<AuditLog>,
    pub registry: Arc<SourceRegistry>,
    pub regime_detector: Arc<RegimeDetector>,
    pub distributor: Arc<Distributor>,
    pub rejected_queue: Arc<RejectedSignalQueue>,
    pub generator: Arc<SignalGenerator>,
    pub executor_service: Arc<ExecutorService>,
    pub start_time: Instant,

    /// Recoverable rejections flowing from the distributor to the queue;
    /// taken once by the queue loop.
    pub rejection_rx: Option<mpsc::UnboundedReceiver<RecoverableRejection>>,
}

impl AppState {
    /// Build the full engine from validated config and resolved secrets.
    ///
    /// Source implementations default to the deterministic sim providers;
    /// real provider plugins register under the same ids in deployment
    /// builds. The shutdown receiver feeds the sync forwarder's lifetime.
    pub fn build(
        config: Config,
        secrets: &Secrets,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());

        // --- Persistence (leaf) ---------------------------------------------
        let store = Arc::new(
            SignalStore::open(&config.store_path, config.batch_size)
                .context("failed to open signal store")?,
        );
        let audit =
            Arc::new(AuditLog::open(&config.audit_path).context("failed to open audit log")?);

        // --- Data sources ---------------------------------------------------
        let implementations: Vec<Arc<dyn DataSource>> = config
            .sources
            .iter()
            .map(|s| Arc::new(SimSource::new(&s.id)) as Arc<dyn DataSource>)
            .collect();
        let registry = Arc::new(SourceRegistry::new(&config.sources, implementations));

        let market_feed = Arc::new(FallbackFeed::new(
            Arc::new(SimMarketFeed::new("sim-primary")) as Arc<dyn MarketDataFeed>,
            Some(Arc::new(SimMarketFeed::new("sim-secondary")) as Arc<dyn MarketDataFeed>),
        ));

        let regime_detector = Arc::new(RegimeDetector::new(config.regime.clone()));

        // --- Local executor service -----------------------------------------
        let broker = Arc::new(SimBroker::new(
            DEV_STARTING_EQUITY,
            config.executor_service.broker_shorts_crypto,
        ));
        let executor_secret = config
            .executor_service
            .secret_name
            .as_deref()
            .and_then(|name| secrets.get(name))
            .unwrap_or_default()
            .to_string();
        let executor_service = ExecutorService::new(
            "local",
            config.executor_service.clone(),
            executor_secret,
            broker,
            &config.executions_path,
            audit.clone(),
            metrics.clone(),
            DEV_STARTING_EQUITY,
        )?;

        // --- Distributor ----------------------------------------------------
        let (distributor, rejection_rx) = Distributor::new(
            &config.executors,
            |name| secrets.get(name).unwrap_or_default().to_string(),
            Duration::from_secs(config.distributor_timeout_secs),
            store.clone(),
            audit.clone(),
            metrics.clone(),
        );

        let rejected_queue = Arc::new(RejectedSignalQueue::new(
            config.rejected_queue.clone(),
            audit.clone(),
            metrics.clone(),
        ));

        // --- Quality / calibration ------------------------------------------
        let calibrator = match &config.quality.calibrator_path {
            Some(path) => Calibrator::load(path).unwrap_or_else(|e| {
                warn!(error = %e, "calibrator load failed, using identity");
                Calibrator::identity()
            }),
            None => Calibrator::identity(),
        };

        // --- Generator on top -----------------------------------------------
        let mut generator = SignalGenerator::new(
            config.clone(),
            registry.clone(),
            market_feed,
            regime_detector.clone(),
            store.clone(),
            audit.clone(),
            distributor.clone(),
            calibrator,
            metrics.clone(),
        );
        if config.alpine_sync.enabled && !config.alpine_sync.endpoint_url.is_empty() {
            let sync = AlpineSync::spawn(config.alpine_sync.endpoint_url.clone(), shutdown);
            generator = generator.with_sync(sync);
            info!(endpoint = %config.alpine_sync.endpoint_url, "alpine sync enabled");
        }
        let generator = Arc::new(generator);
        generator.mark_ready();

        Ok(Self {
            config,
            metrics,
            store,
            audit,
            registry,
            regime_detector,
            distributor,
            rejected_queue,
            generator,
            executor_service,
            start_time: Instant::now(),
            rejection_rx: Some(rejection_rx),
        })
    }

    pub fn health_state(&self) -> Arc<HealthState> {
        Arc::new(HealthState {
            generator: self.generator.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            rejected_queue: self.rejected_queue.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        })
    }
}
