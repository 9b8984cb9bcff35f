//! Worker dispatch port.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{EvaluationId, Model};

/// One on-demand execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    /// Execution reference of the model.
    pub image: String,
    /// Archive references of the staged inputs.
    pub study_refs: Vec<String>,
    /// Labels the execution unit; logged on both sides.
    pub correlation_id: Uuid,
    /// Evaluation ids in the same order as `study_refs`; empty for
    /// classification runs, whose results are keyed by archive id.
    pub evaluation_ids: Vec<EvaluationId>,
    /// Run without GPUs.
    pub cpu: bool,
    /// Topic the worker reports results on.
    pub result_queue: String,
}

/// Starts workers. Every call returns once the worker is launched, never
/// once it finishes.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    /// Launch one execution unit for the batch.
    async fn start_batch(&self, request: BatchRequest) -> DomainResult<()>;

    /// Publish a request to a warm worker queue.
    async fn publish(&self, queue_key: &str, payload: Value) -> DomainResult<()>;

    /// Start warm workers for `model` until `replicas` are running.
    /// Returns how many were started.
    async fn ensure_warm_workers(&self, model: &Model, replicas: u32, cpu: bool)
        -> DomainResult<u32>;
}
