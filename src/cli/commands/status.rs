//! Implementation of the `medai-runner status` command.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::cli::output::{list_table, output, render_list, style_status, CommandOutput};
use crate::cli::runtime::open_store;
use crate::domain::models::{Config, EvaluationStatus, ModelId};

/// Arguments of `status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Restrict evaluation counts to one model
    #[arg(long)]
    pub model: Option<i64>,
}

/// One eval job line.
#[derive(Debug, Serialize)]
pub struct JobRow {
    /// Model id.
    pub model_id: i64,
    /// Model display name.
    pub model: String,
    /// Whether the job is enabled.
    pub running: bool,
    /// `on_demand` or `warm_start`.
    pub mode: String,
    /// Studies per dispatch.
    pub batch_size: u32,
    /// Whether the job runs without GPUs.
    pub cpu: bool,
    /// RFC 3339 time of the last cycle.
    pub last_run: Option<String>,
}

/// Output of `status`.
#[derive(Debug, Serialize)]
pub struct StatusOutput {
    /// Eval jobs.
    pub jobs: Vec<JobRow>,
    /// Evaluation counts by status.
    pub evaluations: Vec<(String, u64)>,
    /// Study counts by type.
    pub study_types: Vec<(String, u64)>,
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        let mut jobs = list_table(&["model", "name", "state", "mode", "batch", "cpu", "last run"]);
        for job in &self.jobs {
            let state = if job.running { "running" } else { "stopped" };
            jobs.add_row(vec![
                job.model_id.to_string(),
                job.model.clone(),
                style_status(state).to_string(),
                job.mode.clone(),
                job.batch_size.to_string(),
                job.cpu.to_string(),
                job.last_run.clone().unwrap_or_else(|| "-".to_string()),
            ]);
        }

        let mut evaluations = list_table(&["status", "count"]);
        for (status, count) in &self.evaluations {
            evaluations.add_row(vec![style_status(status).to_string(), count.to_string()]);
        }

        let mut studies = list_table(&["type", "count"]);
        for (study_type, count) in &self.study_types {
            studies.add_row(vec![study_type.clone(), count.to_string()]);
        }

        [
            render_list("eval job", &jobs, self.jobs.len()),
            format!("Evaluations:\n{evaluations}"),
            render_list("study type", &studies, self.study_types.len()),
        ]
        .join("\n\n")
    }
}

/// Print eval jobs and evaluation and study counts.
pub async fn execute(args: StatusArgs, config: &Config, json_mode: bool) -> Result<()> {
    let store = open_store(config).await?;

    let mut jobs = Vec::new();
    for job in store.models.list_jobs().await? {
        let model = store
            .models
            .get_model(job.model_id)
            .await?
            .map_or_else(|| "?".to_string(), |m| m.display_name);
        jobs.push(JobRow {
            model_id: job.model_id.get(),
            model,
            running: job.running,
            mode: job.dispatch_mode().as_str().to_string(),
            batch_size: job.batch_size,
            cpu: job.cpu,
            last_run: job.last_run.map(|t| t.to_rfc3339()),
        });
    }

    let counts = store.evaluations.count_by_status(args.model.map(ModelId)).await?;
    let evaluations = EvaluationStatus::ALL
        .iter()
        .map(|status| (status.to_string(), counts.get(status).copied().unwrap_or(0)))
        .collect();

    let study_types = store
        .studies
        .count_by_type()
        .await?
        .into_iter()
        .map(|(study_type, count)| (study_type.unwrap_or_else(|| "unclassified".to_string()), count))
        .collect();

    output(
        &StatusOutput {
            jobs,
            evaluations,
            study_types,
        },
        json_mode,
    );
    Ok(())
}
