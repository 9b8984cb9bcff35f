//! Recording dispatcher for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Model, ModelId};
use crate::domain::ports::{BatchRequest, WorkerDispatcher};

#[derive(Debug, Default)]
struct State {
    batches: Vec<BatchRequest>,
    published: Vec<(String, Value)>,
    warm: HashMap<ModelId, u32>,
    fail: bool,
}

/// Dispatcher fake that records requests instead of starting containers.
#[derive(Debug, Clone, Default)]
pub struct MockDispatcher {
    state: Arc<RwLock<State>>,
}

impl MockDispatcher {
    /// Dispatcher that records requests and succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail.
    pub async fn set_failing(&self, fail: bool) {
        self.state.write().await.fail = fail;
    }

    /// Batches started so far.
    pub async fn batches(&self) -> Vec<BatchRequest> {
        self.state.read().await.batches.clone()
    }

    /// (queue, payload) pairs published so far.
    pub async fn published(&self) -> Vec<(String, Value)> {
        self.state.read().await.published.clone()
    }

    /// Warm workers ensured for a model.
    pub async fn warm_workers(&self, model_id: ModelId) -> u32 {
        self.state.read().await.warm.get(&model_id).copied().unwrap_or(0)
    }

    /// Forget recorded batches and publications.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.batches.clear();
        state.published.clear();
    }
}

#[async_trait]
impl WorkerDispatcher for MockDispatcher {
    async fn start_batch(&self, request: BatchRequest) -> DomainResult<()> {
        let mut state = self.state.write().await;
        if state.fail {
            return Err(DomainError::DispatchFailed("mock dispatcher failure".to_string()));
        }
        state.batches.push(request);
        Ok(())
    }

    async fn publish(&self, queue_key: &str, payload: Value) -> DomainResult<()> {
        let mut state = self.state.write().await;
        if state.fail {
            return Err(DomainError::DispatchFailed("mock dispatcher failure".to_string()));
        }
        state.published.push((queue_key.to_string(), payload));
        Ok(())
    }

    async fn ensure_warm_workers(&self, model: &Model, replicas: u32, _cpu: bool) -> DomainResult<u32> {
        let mut state = self.state.write().await;
        if state.fail {
            return Err(DomainError::DispatchFailed("mock dispatcher failure".to_string()));
        }
        let running = state.warm.entry(model.id).or_insert(0);
        let started = replicas.saturating_sub(*running);
        *running += started;
        Ok(started)
    }
}
