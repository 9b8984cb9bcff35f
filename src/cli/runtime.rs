//! Wiring from configuration to running services.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::adapters::archive::OrthancClient;
use crate::adapters::bus::InMemoryBus;
use crate::adapters::dispatch::ContainerDispatcher;
use crate::adapters::sqlite::{database_url, initialize_database, sqlite_store, PoolConfig};
use crate::domain::models::Config;
use crate::domain::ports::{ArchiveClient, NotificationBus, Store, WorkerDispatcher};
use crate::services::{
    ArchiveGarbageCollector, ClassificationCoordinator, DriverServices, EvaluationOrchestrator,
    ExperimentController, Notifier, PeriodicDriver, ResultIngestor,
};

/// Open (and migrate) the configured database.
pub async fn open_store(config: &Config) -> Result<Store> {
    let url = database_url(&config.database.path);
    let pool = initialize_database(
        &url,
        Some(PoolConfig::default().with_max_connections(config.database.max_connections)),
    )
    .await
    .with_context(|| format!("Failed to open database at {}", config.database.path))?;
    Ok(sqlite_store(&pool))
}

/// Every service of a running orchestrator, sharing one store and bus.
pub struct Runtime {
    /// Store over the configured database.
    pub store: Store,
    /// Shared notification bus.
    pub bus: Arc<dyn NotificationBus>,
    /// Evaluation orchestrator.
    pub orchestrator: Arc<EvaluationOrchestrator>,
    /// Experiment controller.
    pub experiments: Arc<ExperimentController>,
    /// Consumes worker results.
    pub ingestor: ResultIngestor,
    /// Fires the periodic jobs.
    pub driver: PeriodicDriver,
}

impl Runtime {
    /// Build the production stack: SQLite, the archive REST client, the
    /// container dispatcher and the in-process bus.
    pub async fn build(config: &Config) -> Result<Self> {
        let store = open_store(config).await?;
        let bus: Arc<dyn NotificationBus> = Arc::new(InMemoryBus::default());
        let archive: Arc<dyn ArchiveClient> =
            Arc::new(OrthancClient::new(&config.archive).context("Failed to build archive client")?);
        let dispatcher: Arc<dyn WorkerDispatcher> =
            Arc::new(ContainerDispatcher::new(config.dispatcher.clone(), bus.clone()));
        Ok(Self::assemble(config, store, bus, archive, dispatcher))
    }

    /// Wire services over the given adapters.
    pub fn assemble(
        config: &Config,
        store: Store,
        bus: Arc<dyn NotificationBus>,
        archive: Arc<dyn ArchiveClient>,
        dispatcher: Arc<dyn WorkerDispatcher>,
    ) -> Self {
        let notifier = Notifier::new(bus.clone());
        let orchestrator = Arc::new(EvaluationOrchestrator::new(
            store.clone(),
            archive.clone(),
            dispatcher.clone(),
            notifier.clone(),
            config.orchestrator.clone(),
        ));
        let experiments = Arc::new(ExperimentController::new(
            store.clone(),
            orchestrator.clone(),
            notifier.clone(),
        ));
        let classification = Arc::new(ClassificationCoordinator::new(
            store.clone(),
            archive.clone(),
            dispatcher.clone(),
            notifier.clone(),
        ));
        let gc = Arc::new(ArchiveGarbageCollector::new(store.clone(), archive));
        let ingestor = ResultIngestor::new(store.clone(), bus.clone(), notifier);

        let driver = PeriodicDriver::new(
            DriverServices {
                store: store.clone(),
                dispatcher,
                orchestrator: orchestrator.clone(),
                experiments: experiments.clone(),
                classification,
                gc,
            },
            config.scheduler.clone(),
            config.orchestrator.clone(),
        );

        Self {
            store,
            bus,
            orchestrator,
            experiments,
            ingestor,
            driver,
        }
    }
}
