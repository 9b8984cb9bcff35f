//! Bundle of store repositories handed to the services.

use std::sync::Arc;

use super::{EvaluationRepository, ExperimentRepository, ModelRepository, StudyRepository};

/// Injectable handle to every store repository.
#[derive(Clone)]
pub struct Store {
    /// Study records.
    pub studies: Arc<dyn StudyRepository>,
    /// Models and eval jobs.
    pub models: Arc<dyn ModelRepository>,
    /// Evaluations.
    pub evaluations: Arc<dyn EvaluationRepository>,
    /// Experiments and their members.
    pub experiments: Arc<dyn ExperimentRepository>,
}

impl Store {
    /// Bundle the repositories.
    pub fn new(
        studies: Arc<dyn StudyRepository>,
        models: Arc<dyn ModelRepository>,
        evaluations: Arc<dyn EvaluationRepository>,
        experiments: Arc<dyn ExperimentRepository>,
    ) -> Self {
        Self {
            studies,
            models,
            evaluations,
            experiments,
        }
    }
}
