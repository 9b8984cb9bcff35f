//! Common test utilities for integration tests
//!
//! Wires the full service stack over an in-memory store, the in-process bus
//! and the mock archive and dispatcher.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use medai_runner::adapters::bus::InMemoryBus;
use medai_runner::adapters::mock::{MockArchive, MockDispatcher};
use medai_runner::adapters::sqlite::{create_migrated_test_pool, sqlite_store};
use medai_runner::cli::runtime::Runtime;
use medai_runner::domain::models::{Config, EvalJob, Model, ModelId};
use medai_runner::domain::ports::{NotificationBus, Store};

pub struct Harness {
    pub runtime: Runtime,
    pub archive: MockArchive,
    pub dispatcher: MockDispatcher,
    pub bus: Arc<InMemoryBus>,
}

impl Harness {
    pub fn store(&self) -> &Store {
        &self.runtime.store
    }
}

pub async fn harness() -> Harness {
    harness_with(Config::default()).await
}

pub async fn harness_with(config: Config) -> Harness {
    let pool = create_migrated_test_pool().await.expect("test pool");
    let archive = MockArchive::new();
    let dispatcher = MockDispatcher::new();
    let bus = Arc::new(InMemoryBus::default());
    let runtime = Runtime::assemble(
        &config,
        sqlite_store(&pool),
        bus.clone() as Arc<dyn NotificationBus>,
        Arc::new(archive.clone()),
        Arc::new(dispatcher.clone()),
    );
    Harness {
        runtime,
        archive,
        dispatcher,
        bus,
    }
}

/// Register a model with a running on-demand eval job.
pub async fn register_model(store: &Store, input_type: &str, modality: &str, batch_size: u32) -> Model {
    let model = store
        .models
        .create_model(&Model {
            id: ModelId(0),
            image: format!("registry/{}:1", input_type.to_lowercase()),
            display_name: format!("{input_type} model"),
            input_type: input_type.to_string(),
            modality: modality.to_string(),
            has_image_output: false,
            concurrency: 1,
        })
        .await
        .expect("create model");
    store
        .models
        .upsert_job(&EvalJob {
            batch_size,
            ..EvalJob::new(model.id)
        })
        .await
        .expect("upsert job");
    model
}

/// Poll an async condition every 10ms until it holds or `timeout_ms` passes.
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
