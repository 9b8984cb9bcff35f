//! Inference model and standing eval job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EvalJobId, ModelId};

/// A versioned inference program consumed as an opaque container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Store id.
    pub id: ModelId,
    /// Execution reference (container image tag).
    pub image: String,
    /// Human-readable name.
    pub display_name: String,
    /// Study type this model accepts as input.
    pub input_type: String,
    /// DICOM modality of accepted studies.
    pub modality: String,
    /// Whether the model writes an auxiliary image artifact.
    pub has_image_output: bool,
    /// Maximum simultaneous dispatch units.
    pub concurrency: u32,
}

/// How evaluations for a model reach a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One execution unit started per cycle with the whole batch.
    OnDemand,
    /// Requests published to a queue consumed by a standing worker pool.
    WarmStart {
        /// Workers kept running for the queue.
        replicas: u32,
    },
}

impl DispatchMode {
    /// Column value.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OnDemand => "on_demand",
            Self::WarmStart { .. } => "warm_start",
        }
    }
}

/// Standing job that polls for work on behalf of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalJob {
    /// Store id.
    pub id: EvalJobId,
    /// Model the job evaluates with.
    pub model_id: ModelId,
    /// Studies selected per cycle.
    pub batch_size: u32,
    /// Paused jobs are skipped by the driver.
    pub running: bool,
    /// Run without GPUs.
    pub cpu: bool,
    /// Warm worker replicas; zero means on-demand dispatch.
    pub replicas: u32,
    /// Purge evaluated studies from the archive during garbage collection.
    pub delete_from_archive: bool,
    /// Time of the last cycle; least recently run jobs go first.
    pub last_run: Option<DateTime<Utc>>,
}

impl EvalJob {
    /// Running on-demand job with a batch of one.
    pub fn new(model_id: ModelId) -> Self {
        Self {
            id: EvalJobId(0),
            model_id,
            batch_size: 1,
            running: true,
            cpu: false,
            replicas: 0,
            delete_from_archive: false,
            last_run: None,
        }
    }

    /// On-demand, or warm-start when replicas are set.
    pub const fn dispatch_mode(&self) -> DispatchMode {
        if self.replicas > 0 {
            DispatchMode::WarmStart {
                replicas: self.replicas,
            }
        } else {
            DispatchMode::OnDemand
        }
    }

    /// Set the batch size.
    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the warm replica count; 0 means on-demand.
    pub const fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set CPU-only execution.
    pub const fn with_cpu(mut self, cpu: bool) -> Self {
        self.cpu = cpu;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_mode_follows_replicas() {
        let job = EvalJob::new(ModelId(3));
        assert_eq!(job.dispatch_mode(), DispatchMode::OnDemand);

        let job = job.with_replicas(2);
        assert_eq!(job.dispatch_mode(), DispatchMode::WarmStart { replicas: 2 });
        assert_eq!(job.dispatch_mode().as_str(), "warm_start");
    }
}
