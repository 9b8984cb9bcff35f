//! Fixed-interval driver for the orchestration entry points.
//!
//! Each job fires when its interval has elapsed and runs as its own task so a
//! slow archive sweep never delays evaluation cycles. A job never overlaps
//! itself, and within one process a model never has two cycles in flight.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;

use crate::domain::errors::DomainResult;
use crate::domain::models::{EvalJob, ExperimentId, ModelId, OrchestratorConfig, SchedulerConfig};
use crate::domain::ports::{Store, WorkerDispatcher};
use crate::services::archive_gc::{ArchiveGarbageCollector, GcReport};
use crate::services::classification_coordinator::{ClassificationCoordinator, ClassificationReport};
use crate::services::evaluation_orchestrator::{CycleReport, EvaluationOrchestrator};
use crate::services::experiment_controller::{ExperimentController, ExperimentProgress};

/// Jobs the driver fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverJob {
    /// One evaluation cycle per running eval job.
    RunEvalJobs,
    /// Discover and classify new archive studies.
    ClassifySweep,
    /// Advance running experiments.
    ExperimentSweep,
    /// Top up warm worker pools.
    WarmWorkers,
    /// Orphan sweep plus archive purge.
    ArchiveGc,
}

impl DriverJob {
    /// Every job, in tick order.
    pub const ALL: [Self; 5] = [
        Self::RunEvalJobs,
        Self::ClassifySweep,
        Self::ExperimentSweep,
        Self::WarmWorkers,
        Self::ArchiveGc,
    ];

    /// Name used in logs and CLI output.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RunEvalJobs => "run_eval_jobs",
            Self::ClassifySweep => "classify_sweep",
            Self::ExperimentSweep => "experiment_sweep",
            Self::WarmWorkers => "warm_workers",
            Self::ArchiveGc => "archive_gc",
        }
    }

    /// Configured firing interval of the job.
    pub const fn interval(&self, config: &SchedulerConfig) -> Duration {
        Duration::from_secs(match self {
            Self::RunEvalJobs => config.eval_jobs_secs,
            Self::ClassifySweep => config.classify_secs,
            Self::ExperimentSweep => config.experiments_secs,
            Self::WarmWorkers => config.warm_workers_secs,
            Self::ArchiveGc => config.archive_gc_secs,
        })
    }
}

impl std::fmt::Display for DriverJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a job run.
#[derive(Debug)]
pub enum JobReport {
    /// One report per eval job cycle that did something.
    EvalJobs(Vec<CycleReport>),
    /// Classification sweep counts.
    Classification(ClassificationReport),
    /// Progress of each running experiment.
    Experiments(Vec<(ExperimentId, ExperimentProgress)>),
    /// Warm workers started.
    WarmWorkers {
        /// Workers launched to reach the configured replicas.
        started: u32,
    },
    /// Archive purge and orphan sweep counts.
    ArchiveGc {
        /// Archive purge counts.
        gc: GcReport,
        /// Unclassified studies dropped by the orphan sweep.
        orphans_removed: u64,
    },
}

impl JobReport {
    /// One-line summary for operators.
    pub fn summary(&self) -> String {
        match self {
            Self::EvalJobs(cycles) => {
                let dispatched: usize = cycles
                    .iter()
                    .filter(|c| !c.dispatch.is_failed())
                    .map(|c| c.dispatch.evaluation_ids().len())
                    .sum();
                let failed: usize = cycles
                    .iter()
                    .filter(|c| c.dispatch.is_failed())
                    .map(|c| c.dispatch.evaluation_ids().len())
                    .sum();
                format!("{} job(s), {dispatched} dispatched, {failed} failed", cycles.len())
            }
            Self::Classification(r) => format!(
                "{} discovered, {} typed, {} sent to classifier, {} removed",
                r.discovered, r.typed_directly, r.sent_to_classifier, r.removed
            ),
            Self::Experiments(progress) => {
                let completed = progress
                    .iter()
                    .filter(|(_, p)| *p == ExperimentProgress::Completed)
                    .count();
                format!("{} experiment(s) advanced, {completed} completed", progress.len())
            }
            Self::WarmWorkers { started } => format!("{started} worker(s) started"),
            Self::ArchiveGc { gc, orphans_removed } => format!(
                "{} purged, {} staged payload(s) removed, {orphans_removed} orphan(s) removed",
                gc.purged, gc.local_removed
            ),
        }
    }
}

/// Holds a key in a shared in-flight set and removes it on drop, so the slot
/// is released however the work ends, panics included.
struct InFlightGuard<K: Eq + Hash + Copy> {
    set: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Eq + Hash + Copy> InFlightGuard<K> {
    /// Claim `key`, or `None` if it is already in flight.
    fn acquire(set: &Arc<Mutex<HashSet<K>>>, key: K) -> Option<Self> {
        let mut inner = set.lock().ok()?;
        inner.insert(key).then(|| Self { set: set.clone(), key })
    }

    /// Take over a key that was inserted by the caller.
    fn adopt(set: &Arc<Mutex<HashSet<K>>>, key: K) -> Self {
        Self { set: set.clone(), key }
    }
}

impl<K: Eq + Hash + Copy> Drop for InFlightGuard<K> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.set.lock() {
            inner.remove(&self.key);
        }
    }
}

/// Services the driver fires into.
#[derive(Clone)]
pub struct DriverServices {
    /// Store handle.
    pub store: Store,
    /// Used for warm worker reconciliation.
    pub dispatcher: Arc<dyn WorkerDispatcher>,
    /// Runs the eval job cycles.
    pub orchestrator: Arc<EvaluationOrchestrator>,
    /// Advances experiments.
    pub experiments: Arc<ExperimentController>,
    /// Classifies new studies.
    pub classification: Arc<ClassificationCoordinator>,
    /// Purges the archive.
    pub gc: Arc<ArchiveGarbageCollector>,
}

/// Fires the orchestration jobs on their intervals.
#[derive(Clone)]
pub struct PeriodicDriver {
    services: DriverServices,
    config: SchedulerConfig,
    orchestrator_config: OrchestratorConfig,
    running: Arc<AtomicBool>,
    active_models: Arc<Mutex<HashSet<ModelId>>>,
    in_progress: Arc<Mutex<HashSet<DriverJob>>>,
    last_fired: Arc<Mutex<HashMap<DriverJob, Instant>>>,
}

impl PeriodicDriver {
    /// Build an idle driver; call `start` to begin ticking.
    pub fn new(services: DriverServices, config: SchedulerConfig, orchestrator_config: OrchestratorConfig) -> Self {
        Self {
            services,
            config,
            orchestrator_config,
            running: Arc::new(AtomicBool::new(false)),
            active_models: Arc::new(Mutex::new(HashSet::new())),
            in_progress: Arc::new(Mutex::new(HashSet::new())),
            last_fired: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one cycle per running eval job, models in parallel, least recently
    /// run first. Models already cycling in this process are skipped.
    pub async fn run_eval_jobs(&self) -> DomainResult<Vec<CycleReport>> {
        let jobs = self.services.store.models.list_running_jobs().await?;

        let mut claimed: Vec<(EvalJob, InFlightGuard<ModelId>)> = Vec::with_capacity(jobs.len());
        for job in jobs {
            match InFlightGuard::acquire(&self.active_models, job.model_id) {
                Some(guard) => claimed.push((job, guard)),
                None => tracing::debug!(model_id = %job.model_id, "cycle still in progress, skipping"),
            }
        }

        let results = join_all(claimed.iter().map(|(job, _)| async move {
            let result = self
                .services
                .orchestrator
                .run_cycle(job.model_id, job.batch_size as usize, job.cpu)
                .await;
            if let Err(e) = self.services.store.models.touch_last_run(job.model_id, Utc::now()).await {
                tracing::warn!(model_id = %job.model_id, error = %e, "failed to record last run");
            }
            result
        }))
        .await;

        let mut reports = Vec::with_capacity(results.len());
        for ((job, _guard), result) in claimed.iter().zip(results) {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(model_id = %job.model_id, error = %e, "evaluation cycle failed"),
            }
        }
        Ok(reports)
    }

    /// Keep warm worker pools at their configured size.
    pub async fn warm_workers(&self) -> DomainResult<u32> {
        let mut started = 0;
        for job in self.services.store.models.list_running_jobs().await? {
            if job.replicas == 0 {
                continue;
            }
            let Some(model) = self.services.store.models.get_model(job.model_id).await? else {
                tracing::warn!(model_id = %job.model_id, "eval job references missing model");
                continue;
            };
            match self
                .services
                .dispatcher
                .ensure_warm_workers(&model, job.replicas, job.cpu)
                .await
            {
                Ok(n) => started += n,
                Err(e) => tracing::error!(model_id = %model.id, error = %e, "failed to start warm workers"),
            }
        }
        Ok(started)
    }

    /// Reap orphaned evaluations and stale unclassified studies.
    pub async fn orphan_sweep(&self) -> DomainResult<u64> {
        let tolerance = Duration::from_secs(self.orchestrator_config.orphan_tolerance_secs);
        let evaluations = self.services.orchestrator.remove_orphans(tolerance).await?;
        let studies = self.services.classification.remove_unclassified(tolerance).await?;
        Ok(evaluations + studies)
    }

    /// Run one job to completion.
    pub async fn run_job(&self, job: DriverJob) -> DomainResult<JobReport> {
        match job {
            DriverJob::RunEvalJobs => self.run_eval_jobs().await.map(JobReport::EvalJobs),
            DriverJob::ClassifySweep => self
                .services
                .classification
                .sweep(self.orchestrator_config.classification_batch_size)
                .await
                .map(JobReport::Classification),
            DriverJob::ExperimentSweep => self
                .services
                .experiments
                .advance_all(self.orchestrator_config.experiment_batch_size)
                .await
                .map(JobReport::Experiments),
            DriverJob::WarmWorkers => self
                .warm_workers()
                .await
                .map(|started| JobReport::WarmWorkers { started }),
            DriverJob::ArchiveGc => {
                // Both steps run even if the first fails.
                let orphans = self.orphan_sweep().await;
                if let Err(e) = &orphans {
                    tracing::error!(error = %e, "orphan sweep failed");
                }
                let gc = self.services.gc.collect().await;
                if let Err(e) = &gc {
                    tracing::error!(error = %e, "archive garbage collection failed");
                }
                Ok(JobReport::ArchiveGc {
                    orphans_removed: orphans?,
                    gc: gc?,
                })
            }
        }
    }

    /// Run every job once, in order. Errors are logged per job.
    pub async fn tick_once(&self) -> Vec<(DriverJob, DomainResult<JobReport>)> {
        let mut results = Vec::with_capacity(DriverJob::ALL.len());
        for job in DriverJob::ALL {
            results.push((job, self.run_job(job).await));
        }
        results
    }

    fn due_jobs(&self, now: Instant) -> Vec<DriverJob> {
        let Ok(mut last_fired) = self.last_fired.lock() else {
            return Vec::new();
        };
        let Ok(mut in_progress) = self.in_progress.lock() else {
            return Vec::new();
        };

        let mut due = Vec::new();
        for job in DriverJob::ALL {
            let elapsed = last_fired
                .get(&job)
                .map_or(true, |last| now.duration_since(*last) >= job.interval(&self.config));
            if elapsed && in_progress.insert(job) {
                last_fired.insert(job, now);
                due.push(job);
            }
        }
        due
    }

    fn spawn_job(&self, job: DriverJob) {
        let driver = self.clone();
        tokio::spawn(async move {
            let _slot = InFlightGuard::adopt(&driver.in_progress, job);
            match driver.run_job(job).await {
                Ok(report) => tracing::debug!(job = %job, ?report, "driver job finished"),
                Err(e) => tracing::error!(job = %job, error = %e, "driver job failed"),
            }
        });
    }

    /// Start the tick loop. The orphan sweep runs once before the first tick.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let driver = self.clone();
        let tick_interval = Duration::from_millis(self.config.tick_interval_ms);

        tokio::spawn(async move {
            match driver.orphan_sweep().await {
                Ok(removed) => tracing::info!(removed, "startup orphan sweep finished"),
                Err(e) => tracing::error!(error = %e, "startup orphan sweep failed"),
            }

            while driver.running.load(Ordering::SeqCst) {
                for job in driver.due_jobs(Instant::now()) {
                    driver.spawn_job(job);
                }
                tokio::time::sleep(tick_interval).await;
            }
            tracing::info!("periodic driver stopped");
        })
    }

    /// Stop the loop after the current tick. Jobs already running finish.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bus::InMemoryBus;
    use crate::adapters::mock::{MockArchive, MockDispatcher};
    use crate::adapters::sqlite::{create_migrated_test_pool, sqlite_store};
    use crate::domain::models::{Model, NewStudy};
    use crate::services::notifier::Notifier;

    struct Fixture {
        store: Store,
        archive: MockArchive,
        dispatcher: MockDispatcher,
        driver: PeriodicDriver,
    }

    async fn fixture(config: SchedulerConfig) -> Fixture {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = sqlite_store(&pool);
        let archive = MockArchive::new();
        let dispatcher = MockDispatcher::new();
        let notifier = Notifier::new(Arc::new(InMemoryBus::default()));
        let orchestrator_config = OrchestratorConfig::default();

        let orchestrator = Arc::new(EvaluationOrchestrator::new(
            store.clone(),
            Arc::new(archive.clone()),
            Arc::new(dispatcher.clone()),
            notifier.clone(),
            orchestrator_config.clone(),
        ));
        let services = DriverServices {
            store: store.clone(),
            dispatcher: Arc::new(dispatcher.clone()),
            orchestrator: orchestrator.clone(),
            experiments: Arc::new(ExperimentController::new(store.clone(), orchestrator, notifier.clone())),
            classification: Arc::new(ClassificationCoordinator::new(
                store.clone(),
                Arc::new(archive.clone()),
                Arc::new(dispatcher.clone()),
                notifier,
            )),
            gc: Arc::new(ArchiveGarbageCollector::new(store.clone(), Arc::new(archive.clone()))),
        };

        Fixture {
            store,
            archive,
            dispatcher,
            driver: PeriodicDriver::new(services, config, orchestrator_config),
        }
    }

    async fn add_model(store: &Store, input_type: &str, job: impl FnOnce(ModelId) -> EvalJob) -> Model {
        let model = store
            .models
            .create_model(&Model {
                id: ModelId(0),
                image: format!("registry/{input_type}:1"),
                display_name: input_type.to_string(),
                input_type: input_type.to_string(),
                modality: "CT".to_string(),
                has_image_output: false,
                concurrency: 1,
            })
            .await
            .unwrap();
        store.models.upsert_job(&job(model.id)).await.unwrap();
        model
    }

    #[tokio::test]
    async fn test_tick_once_classifies_then_evaluates() {
        let f = fixture(SchedulerConfig::default()).await;
        add_model(&f.store, "CT", EvalJob::new).await;
        f.archive.add_study("s1", "CT").await;

        let results = f.driver.tick_once().await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        // Evaluation jobs run before the classification sweep in a tick.
        f.driver.run_eval_jobs().await.unwrap();
        let batches = f.dispatcher.batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].study_refs, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_eval_jobs_touch_last_run_and_skip_stopped() {
        let f = fixture(SchedulerConfig::default()).await;
        let active = add_model(&f.store, "CT", EvalJob::new).await;
        let stopped = add_model(&f.store, "MR", |id| {
            let mut job = EvalJob::new(id);
            job.running = false;
            job
        })
        .await;

        let reports = f.driver.run_eval_jobs().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].model_id, active.id);

        let job = f.store.models.get_job(active.id).await.unwrap().unwrap();
        assert!(job.last_run.is_some());
        let job = f.store.models.get_job(stopped.id).await.unwrap().unwrap();
        assert!(job.last_run.is_none());
    }

    #[tokio::test]
    async fn test_active_model_is_not_cycled_twice() {
        let f = fixture(SchedulerConfig::default()).await;
        let model = add_model(&f.store, "CT", EvalJob::new).await;

        let guard = InFlightGuard::acquire(&f.driver.active_models, model.id).unwrap();
        assert!(InFlightGuard::acquire(&f.driver.active_models, model.id).is_none());
        assert!(f.driver.run_eval_jobs().await.unwrap().is_empty());

        drop(guard);
        assert_eq!(f.driver.run_eval_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_warm_workers_started_for_replicated_jobs() {
        let f = fixture(SchedulerConfig::default()).await;
        let model = add_model(&f.store, "CT", |id| EvalJob::new(id).with_replicas(2)).await;
        add_model(&f.store, "MR", EvalJob::new).await;

        assert_eq!(f.driver.warm_workers().await.unwrap(), 2);
        assert_eq!(f.driver.warm_workers().await.unwrap(), 0);
        assert_eq!(f.dispatcher.warm_workers(model.id).await, 2);
    }

    #[tokio::test]
    async fn test_due_jobs_respect_intervals_and_overlap() {
        let f = fixture(SchedulerConfig::default()).await;
        let now = Instant::now();

        assert_eq!(f.driver.due_jobs(now).len(), DriverJob::ALL.len());
        // Still in progress and not yet due.
        assert!(f.driver.due_jobs(now + Duration::from_secs(3600)).is_empty());

        f.driver.in_progress.lock().unwrap().clear();
        let due = f.driver.due_jobs(now + Duration::from_secs(20));
        assert!(due.contains(&DriverJob::RunEvalJobs));
        assert!(due.contains(&DriverJob::ClassifySweep));
        assert!(!due.contains(&DriverJob::ArchiveGc));
    }

    #[tokio::test]
    async fn test_driver_loop_survives_failures_and_stops() {
        let f = fixture(SchedulerConfig {
            tick_interval_ms: 10,
            classify_secs: 0,
            ..SchedulerConfig::default()
        })
        .await;
        f.archive.set_unavailable(true).await;
        f.store.studies.insert_new(&NewStudy::new("x")).await.unwrap();

        let handle = f.driver.start();
        for _ in 0..100 {
            if f.archive.list_calls().await >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.driver.is_running());
        assert!(
            f.archive.list_calls().await >= 2,
            "failing classify sweep should fire again on a later tick"
        );
        f.driver.stop();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_archive_gc_runs_collection_when_sweep_fails() {
        let f = fixture(SchedulerConfig::default()).await;
        let model = add_model(&f.store, "CT", |id| {
            let mut job = EvalJob::new(id);
            job.delete_from_archive = true;
            job
        })
        .await;
        f.archive.add_study("done", "CT").await;
        let study = f.store.studies.insert_new(&NewStudy::new("done")).await.unwrap().unwrap();
        let ids = f.store.evaluations.create_running(model.id, &[study.id]).await.unwrap();
        f.store
            .evaluations
            .complete(ids[0], &serde_json::json!({}), None)
            .await
            .unwrap();

        let failing = PeriodicDriver::new(
            f.driver.services.clone(),
            SchedulerConfig::default(),
            OrchestratorConfig {
                orphan_tolerance_secs: u64::MAX,
                ..OrchestratorConfig::default()
            },
        );
        assert!(failing.run_job(DriverJob::ArchiveGc).await.is_err());
        assert_eq!(f.archive.deleted_remote().await, vec!["done".to_string()]);
    }

    #[tokio::test]
    async fn test_job_slot_released_when_job_panics() {
        let f = fixture(SchedulerConfig::default()).await;
        f.driver.in_progress.lock().unwrap().insert(DriverJob::WarmWorkers);

        let set = f.driver.in_progress.clone();
        let task = tokio::spawn(async move {
            let _slot = InFlightGuard::adopt(&set, DriverJob::WarmWorkers);
            panic!("job blew up");
        });
        assert!(task.await.unwrap_err().is_panic());
        assert!(f.driver.in_progress.lock().unwrap().is_empty());
    }
}
