//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use clap::{Parser, Subcommand};

use crate::cli::commands::experiment::ExperimentArgs;
use crate::cli::commands::init::InitArgs;
use crate::cli::commands::model::ModelArgs;
use crate::cli::commands::run::RunArgs;
use crate::cli::commands::status::StatusArgs;
use crate::cli::commands::tick::TickArgs;

/// Command-line entry point.
#[derive(Parser)]
#[command(name = "medai-runner")]
#[command(about = "MedAI Runner - imaging evaluation orchestrator", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

/// Top-level subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create the .medai directory, default config and database
    Init(InitArgs),

    /// Run the result ingestor and periodic driver until interrupted
    Run(RunArgs),

    /// Fire every driver job once and exit
    Tick(TickArgs),

    /// Show eval jobs, evaluation counts and study types
    Status(StatusArgs),

    /// Register models, eval jobs and classifiers
    Model(ModelArgs),

    /// Create, start, stop and list experiments
    Experiment(ExperimentArgs),
}

impl Commands {
    /// Long-running commands log at the configured level; one-shot commands
    /// only surface warnings so their output stays readable.
    pub const fn is_long_running(&self) -> bool {
        matches!(self, Self::Run(_))
    }
}
