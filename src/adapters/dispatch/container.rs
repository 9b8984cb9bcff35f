//! Container engine dispatcher.
//!
//! Drives the `docker` (or compatible) CLI. On-demand batches run as detached
//! `--rm` containers; warm workers are long-lived containers labelled with
//! their model id and fed through the bus.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{join_ids, DispatcherConfig, Model, ModelId, Topic};
use crate::domain::ports::{BatchRequest, NotificationBus, WorkerDispatcher};

/// Mount point of the shared images volume inside workers.
pub const WORKER_IMAGES_DIR: &str = "/opt/images";

const CORRELATION_LABEL: &str = "medai.correlation";
const MODEL_LABEL: &str = "medai.model";

/// [`WorkerDispatcher`] over a container engine CLI.
pub struct ContainerDispatcher {
    config: DispatcherConfig,
    bus: Arc<dyn NotificationBus>,
}

impl ContainerDispatcher {
    /// Dispatcher publishing warm batches on `bus`.
    pub fn new(config: DispatcherConfig, bus: Arc<dyn NotificationBus>) -> Self {
        Self { config, bus }
    }

    fn common_args(&self, cpu: bool) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "-v".to_string(),
            format!("{}:{WORKER_IMAGES_DIR}", self.config.images_volume),
        ];
        if let Some(network) = &self.config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if self.config.gpus && !cpu {
            args.push("--gpus".to_string());
            args.push("all".to_string());
        }
        args
    }

    /// Arguments for a single on-demand batch container.
    pub fn batch_args(&self, request: &BatchRequest) -> Vec<String> {
        let mut args = self.common_args(request.cpu);
        args.push("--rm".to_string());
        args.push("--label".to_string());
        args.push(format!("{CORRELATION_LABEL}={}", request.correlation_id));

        let env = [
            ("RESULT_QUEUE", request.result_queue.clone()),
            ("FILENAMES", request.study_refs.join(",")),
            ("ID", request.correlation_id.to_string()),
            ("RUN_SINGLE", "True".to_string()),
            ("DB_IDs", join_ids(&request.evaluation_ids)),
        ];
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(request.image.clone());
        args
    }

    /// Arguments for one warm worker of `model`.
    pub fn warm_worker_args(&self, model: &Model, cpu: bool, worker_id: Uuid) -> Vec<String> {
        let mut args = self.common_args(cpu);
        args.push("--label".to_string());
        args.push(format!("{MODEL_LABEL}={}", model.id));

        let env = [
            ("ID", worker_id.to_string()),
            ("QUEUE", Topic::WorkerQueue(model.id).name()),
            ("RESULT_QUEUE", Topic::EvaluationResults.name()),
        ];
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        args.push(model.image.clone());
        args
    }

    async fn run_engine(&self, args: &[String]) -> DomainResult<String> {
        let output = Command::new(&self.config.engine)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DomainError::DispatchFailed(format!("failed to run {}: {e}", self.config.engine)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DomainError::DispatchFailed(format!(
                "{} exited with {}: {}",
                self.config.engine,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn running_workers(&self, model_id: ModelId) -> DomainResult<u32> {
        let filter = format!("label={MODEL_LABEL}={model_id}");
        let stdout = self
            .run_engine(&["ps".to_string(), "-q".to_string(), "--filter".to_string(), filter])
            .await?;
        Ok(u32::try_from(stdout.lines().filter(|l| !l.trim().is_empty()).count()).unwrap_or(u32::MAX))
    }
}

#[async_trait]
impl WorkerDispatcher for ContainerDispatcher {
    async fn start_batch(&self, request: BatchRequest) -> DomainResult<()> {
        let args = self.batch_args(&request);
        let container = self.run_engine(&args).await?;
        tracing::info!(
            image = %request.image,
            correlation_id = %request.correlation_id,
            container = %container,
            studies = request.study_refs.len(),
            "started worker batch"
        );
        Ok(())
    }

    async fn publish(&self, queue_key: &str, payload: Value) -> DomainResult<()> {
        let model_id = queue_key
            .parse::<i64>()
            .map(ModelId)
            .map_err(|_| DomainError::ValidationFailed(format!("invalid worker queue key: {queue_key}")))?;
        let reached = self.bus.send(&Topic::WorkerQueue(model_id), payload)?;
        if reached == 0 {
            return Err(DomainError::DispatchFailed(format!(
                "no warm worker is consuming queue {queue_key}"
            )));
        }
        tracing::debug!(queue = queue_key, workers = reached, "published warm-start request");
        Ok(())
    }

    async fn ensure_warm_workers(&self, model: &Model, replicas: u32, cpu: bool) -> DomainResult<u32> {
        let running = self.running_workers(model.id).await?;
        let missing = replicas.saturating_sub(running);

        for _ in 0..missing {
            let args = self.warm_worker_args(model, cpu, Uuid::new_v4());
            self.run_engine(&args).await?;
        }

        if missing > 0 {
            tracing::info!(model_id = %model.id, running, started = missing, "started warm workers");
        }
        Ok(missing)
    }
}
