//! Implementation of the `medai-runner tick` command.

use anyhow::{bail, Result};
use clap::Args;
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::cli::runtime::Runtime;
use crate::domain::models::Config;
use crate::services::DriverJob;

/// Arguments of `tick`.
#[derive(Args, Debug)]
pub struct TickArgs {
    /// Run only this job (run_eval_jobs, classify_sweep, experiment_sweep,
    /// warm_workers, archive_gc)
    #[arg(long)]
    pub job: Option<String>,
}

/// Outcome of one job.
#[derive(Debug, Serialize)]
pub struct JobLine {
    /// Job name.
    pub job: String,
    /// Whether the job succeeded.
    pub ok: bool,
    /// Report summary, or the error.
    pub summary: String,
}

/// Output of `tick`.
#[derive(Debug, Serialize)]
pub struct TickOutput {
    /// One line per job run.
    pub jobs: Vec<JobLine>,
}

impl CommandOutput for TickOutput {
    fn to_human(&self) -> String {
        self.jobs
            .iter()
            .map(|line| {
                let mark = if line.ok {
                    console::style("ok").green()
                } else {
                    console::style("failed").red().bold()
                };
                format!("{:<18} {mark:<8} {}", line.job, line.summary)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn parse_job(name: &str) -> Option<DriverJob> {
    DriverJob::ALL.into_iter().find(|job| job.as_str() == name)
}

/// Run the selected jobs once and report each outcome.
pub async fn execute(args: TickArgs, config: &Config, json_mode: bool) -> Result<()> {
    let jobs: Vec<DriverJob> = match args.job.as_deref() {
        None => DriverJob::ALL.to_vec(),
        Some(name) => match parse_job(name) {
            Some(job) => vec![job],
            None => bail!("Unknown job: {name}"),
        },
    };

    let runtime = Runtime::build(config).await?;
    let mut lines = Vec::with_capacity(jobs.len());
    for job in jobs {
        let line = match runtime.driver.run_job(job).await {
            Ok(report) => JobLine {
                job: job.to_string(),
                ok: true,
                summary: report.summary(),
            },
            Err(e) => JobLine {
                job: job.to_string(),
                ok: false,
                summary: e.to_string(),
            },
        };
        lines.push(line);
    }

    output(&TickOutput { jobs: lines }, json_mode);
    Ok(())
}
