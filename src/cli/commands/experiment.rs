//! Experiment CLI commands.

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{list_table, output, render_list, style_status, CommandOutput};
use crate::cli::runtime::Runtime;
use crate::domain::models::{Config, Experiment, ExperimentId, ModelId, StudyId, TransitionOutcome};

/// Arguments of `experiment`.
#[derive(Args, Debug)]
pub struct ExperimentArgs {
    /// Experiment subcommand.
    #[command(subcommand)]
    pub command: ExperimentCommand,
}

/// Experiment lifecycle commands.
#[derive(Subcommand, Debug)]
pub enum ExperimentCommand {
    /// Create an experiment over a fixed set of studies
    Create {
        /// Experiment name
        name: String,

        /// Model under test
        #[arg(long)]
        model: i64,

        /// Member study ids (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        studies: Vec<i64>,

        /// User notified about progress
        #[arg(long)]
        user: Option<i64>,
    },

    /// Move a NEW experiment to RUNNING
    Start {
        /// Experiment id
        id: i64,
    },

    /// Stop an experiment and notify its owner
    Stop {
        /// Experiment id
        id: i64,

        /// Reason sent to the owner
        #[arg(long, default_value = "stopped by operator")]
        reason: String,
    },

    /// List experiments
    List,
}

/// Result of an experiment mutation.
#[derive(Debug, Serialize)]
pub struct ExperimentOutput {
    /// Summary line.
    pub message: String,
    /// Experiment acted on.
    pub experiment_id: i64,
    /// False when the experiment was already in the target state.
    pub changed: bool,
}

impl CommandOutput for ExperimentOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

/// Output of `experiment list`.
#[derive(Debug, Serialize)]
pub struct ExperimentListOutput {
    /// All experiments.
    pub experiments: Vec<Experiment>,
}

impl CommandOutput for ExperimentListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["id", "name", "model", "status", "updated"]);
        for experiment in &self.experiments {
            table.add_row(vec![
                experiment.id.to_string(),
                experiment.name.clone(),
                experiment.model_id.to_string(),
                style_status(experiment.status.as_str()).to_string(),
                experiment.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            ]);
        }
        render_list("experiment", &table, self.experiments.len())
    }
}

/// Run an `experiment` subcommand.
pub async fn execute(args: ExperimentArgs, config: &Config, json_mode: bool) -> Result<()> {
    let runtime = Runtime::build(config).await?;

    match args.command {
        ExperimentCommand::Create {
            name,
            model,
            studies,
            user,
        } => {
            let model_id = ModelId(model);
            if runtime.store.models.get_model(model_id).await?.is_none() {
                bail!("Model not found: {model_id}");
            }
            let study_ids: Vec<StudyId> = studies.into_iter().map(StudyId).collect();
            let experiment = runtime
                .store
                .experiments
                .create(&name, model_id, user, &study_ids)
                .await?;
            output(
                &ExperimentOutput {
                    message: format!(
                        "Created experiment {} with {} studies",
                        experiment.id,
                        study_ids.len()
                    ),
                    experiment_id: experiment.id.get(),
                    changed: true,
                },
                json_mode,
            );
        }
        ExperimentCommand::Start { id } => {
            let outcome = runtime.experiments.start_experiment(ExperimentId(id)).await?;
            output(&transition_output(id, outcome, "started"), json_mode);
        }
        ExperimentCommand::Stop { id, reason } => {
            let outcome = runtime
                .experiments
                .stop_experiment(ExperimentId(id), &reason)
                .await?;
            output(&transition_output(id, outcome, "stopped"), json_mode);
        }
        ExperimentCommand::List => {
            let experiments = runtime.store.experiments.list().await?;
            output(&ExperimentListOutput { experiments }, json_mode);
        }
    }
    Ok(())
}

fn transition_output(id: i64, outcome: TransitionOutcome, verb: &str) -> ExperimentOutput {
    let changed = outcome == TransitionOutcome::Applied;
    ExperimentOutput {
        message: if changed {
            format!("Experiment {id} {verb}")
        } else {
            format!("Experiment {id} already {verb}")
        },
        experiment_id: id,
        changed,
    }
}
