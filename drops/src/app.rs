//! Service wiring and lifecycle.
//!
//! [`DropServices::build`] wires every service over an injected
//! [`DropEnvironment`], so tests run the full stack over in-memory stores.
//! [`DropApp::connect`] builds the production environment (`PostgreSQL`,
//! Redis and the HTTP collaborators) from [`Config`].

use crate::admission::AdmissionController;
use crate::collaborators::{HttpCatalogClient, HttpOrderClient, LoggingAlertSink};
use crate::config::{Config, ConfigError};
use crate::ledger::StockLedger;
use crate::payment::PaymentSettlement;
use crate::reaper::ReservationReaper;
use crate::reservation::ReservationManager;
use crate::session::{SessionSweeper, ShoppingSessions};
use crate::sync::SyncFabric;
use flashdrop_core::collaborators::{CatalogService, CollaboratorError, OrderService, StockAlertSink};
use flashdrop_core::environment::{Clock, SystemClock};
use flashdrop_core::store::{QueueStore, ReservationStore, StockStore, StoreError};
use flashdrop_core::sync::{SnapshotStore, SyncBus, SyncError};
use flashdrop_postgres::PostgresStore;
use flashdrop_redis::RedisSyncBus;
use flashdrop_runtime::{HealthCheck, HealthReport};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Errors raised while bringing the service up.
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Database unreachable or migration failed
    #[error("Database: {0}")]
    Store(#[from] StoreError),

    /// Redis unreachable
    #[error("Sync fabric: {0}")]
    Sync(#[from] SyncError),

    /// Collaborator client could not be built
    #[error("Collaborator: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Everything the services depend on.
#[derive(Clone)]
pub struct DropEnvironment {
    /// Stock records
    pub stocks: Arc<dyn StockStore>,
    /// Reservation records
    pub reservations: Arc<dyn ReservationStore>,
    /// Admission queues
    pub queues: Arc<dyn QueueStore>,
    /// Live event channel
    pub bus: Arc<dyn SyncBus>,
    /// Per-drop snapshots for late joiners
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Product catalog
    pub catalog: Arc<dyn CatalogService>,
    /// Order service
    pub orders: Arc<dyn OrderService>,
    /// Low-stock signal receiver
    pub alerts: Arc<dyn StockAlertSink>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

/// The wired services of one replica.
#[derive(Clone)]
pub struct DropServices {
    /// Sync fabric
    pub sync: SyncFabric,
    /// Stock ledger
    pub ledger: StockLedger,
    /// Reservation manager
    pub reservations: ReservationManager,
    /// Reservation reaper
    pub reaper: ReservationReaper,
    /// Admission controller
    pub admission: AdmissionController,
    /// Explicit session ends
    pub sessions: ShoppingSessions,
    /// Shopping-window sweeper
    pub sweeper: SessionSweeper,
    /// Payment settlement
    pub payments: PaymentSettlement,
}

impl DropServices {
    /// Wire every service over `env`.
    #[must_use]
    pub fn build(env: DropEnvironment, config: &Config) -> Self {
        let sync = SyncFabric::new(env.bus, env.snapshots, Arc::clone(&env.clock), config.sync.clone());
        let ledger = StockLedger::new(
            env.stocks,
            env.catalog,
            env.alerts,
            sync.clone(),
            Arc::clone(&env.clock),
            config.ledger.clone(),
        );
        let reservations = ReservationManager::new(
            ledger.clone(),
            env.reservations,
            env.orders,
            Arc::clone(&env.clock),
            config.reservations.clone(),
        );
        let reaper = ReservationReaper::new(
            reservations.clone(),
            config.reservations.reaper_interval,
            config.reservations.reaper_batch_size,
        );
        let admission = AdmissionController::new(env.queues, sync.clone(), env.clock, config.queue.clone());
        let sessions = ShoppingSessions::new(reservations.clone(), admission.clone());
        let sweeper = SessionSweeper::new(sessions.clone(), config.queue.session_sweep_interval);
        let payments = PaymentSettlement::new(reservations.clone());

        Self {
            sync,
            ledger,
            reservations,
            reaper,
            admission,
            sessions,
            sweeper,
            payments,
        }
    }

    /// Start the reaper, the session sweeper and the outbox relay.
    #[must_use]
    pub fn start(&self) -> BackgroundTasks {
        let (shutdown, _) = broadcast::channel(1);
        let handles = vec![
            ("reaper", tokio::spawn(self.reaper.clone().run(shutdown.subscribe()))),
            ("session-sweeper", tokio::spawn(self.sweeper.clone().run(shutdown.subscribe()))),
            ("sync-relay", tokio::spawn(self.sync.clone().run_relay(shutdown.subscribe()))),
        ];
        tracing::info!(tasks = handles.len(), "Background tasks started");
        BackgroundTasks { shutdown, handles }
    }
}

/// Running background tasks of a replica.
pub struct BackgroundTasks {
    shutdown: broadcast::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// A receiver for the same shutdown signal, for tasks spawned elsewhere.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Signal every task and wait up to `timeout` for each to stop.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown.send(());
        for (name, handle) in self.handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => tracing::info!(task = name, "Task stopped gracefully"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Task failed"),
                Err(_) => tracing::warn!(task = name, "Task shutdown timed out"),
            }
        }
    }
}

/// Production wiring.
pub struct DropApp {
    config: Config,
    services: DropServices,
    postgres: PostgresStore,
    redis: RedisSyncBus,
}

impl DropApp {
    /// Connect to `PostgreSQL` and Redis and wire the services.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if the config is invalid or a backend is unreachable.
    pub async fn connect(config: Config) -> Result<Self, AppError> {
        config.validate()?;

        let postgres = PostgresStore::connect(&config.database.url, config.database.max_connections).await?;
        if config.database.run_migrations {
            postgres.migrate().await?;
            tracing::info!("Database migrations applied");
        }

        let redis = RedisSyncBus::builder()
            .url(config.redis.url.clone())
            .key_prefix(config.redis.key_prefix.clone())
            .build()
            .await?;
        let snapshots = redis.snapshot_store(Some(config.redis.snapshot_ttl));

        let catalog = HttpCatalogClient::new(
            &config.collaborators.catalog_url,
            config.collaborators.request_timeout,
        )?;
        let orders = HttpOrderClient::new(
            &config.collaborators.orders_url,
            config.collaborators.request_timeout,
        )?;

        let store = Arc::new(postgres.clone());
        let env = DropEnvironment {
            stocks: store.clone(),
            reservations: store.clone(),
            queues: store,
            bus: Arc::new(redis.clone()),
            snapshots: Arc::new(snapshots),
            catalog: Arc::new(catalog),
            orders: Arc::new(orders),
            alerts: Arc::new(LoggingAlertSink),
            clock: Arc::new(SystemClock),
        };
        let services = DropServices::build(env, &config);
        tracing::info!("Drop services wired");

        Ok(Self {
            config,
            services,
            postgres,
            redis,
        })
    }

    /// The wired services.
    #[must_use]
    pub const fn services(&self) -> &DropServices {
        &self.services
    }

    /// The configuration the app was built from.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Start the background tasks.
    #[must_use]
    pub fn start(&self) -> BackgroundTasks {
        self.services.start()
    }

    /// Database, Redis, breaker and outbox health.
    pub async fn health(&self) -> HealthReport {
        let mut checks = vec![
            match self.postgres.ping().await {
                Ok(()) => HealthCheck::healthy("postgres"),
                Err(e) => HealthCheck::unhealthy("postgres", e.to_string()),
            },
            match self.redis.ping().await {
                Ok(()) => HealthCheck::healthy("redis"),
                Err(e) => HealthCheck::unhealthy("redis", e.to_string()),
            },
        ];
        checks.extend(self.services.sync.health_checks());
        HealthReport::new(checks)
    }
}
