//! Implementation of the `medai-runner init` command.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tokio::fs;

use crate::adapters::sqlite::{database_url, initialize_database};
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;

/// Arguments of `init`.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config file
    #[arg(long, short)]
    pub force: bool,

    /// Target directory (defaults to current directory)
    #[arg(default_value = ".")]
    pub path: PathBuf,
}

/// Output of `init`.
#[derive(Debug, serde::Serialize)]
pub struct InitOutput {
    /// Whether initialization finished.
    pub success: bool,
    /// Summary line.
    pub message: String,
    /// Root of the data directory.
    pub initialized_path: PathBuf,
    /// Directories created by this run.
    pub directories_created: Vec<String>,
    /// False when an existing config was kept.
    pub config_written: bool,
    /// Whether migrations ran.
    pub database_initialized: bool,
}

impl CommandOutput for InitOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![self.message.clone()];
        if !self.directories_created.is_empty() {
            lines.push("\nCreated directories:".to_string());
            for dir in &self.directories_created {
                lines.push(format!("  - {dir}"));
            }
        }
        if self.config_written {
            lines.push("\nWrote default config to .medai/config.yaml".to_string());
        }
        if self.database_initialized {
            lines.push("Database initialized at .medai/medai.db".to_string());
        }
        lines.join("\n")
    }
}

/// Create the data directory, config file and database.
pub async fn execute(args: InitArgs, json_mode: bool) -> Result<()> {
    let target_path = if args.path.is_absolute() {
        args.path.clone()
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&args.path)
    };
    let medai_dir = target_path.join(".medai");

    let mut directories_created = vec![];
    for dir in [medai_dir.clone(), medai_dir.join("images"), medai_dir.join("logs")] {
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let relative = dir
                .strip_prefix(&target_path)
                .unwrap_or(&dir)
                .to_string_lossy()
                .to_string();
            directories_created.push(relative);
        }
    }

    let config_path = medai_dir.join("config.yaml");
    let config_written = args.force || !config_path.exists();
    if config_written {
        let yaml = serde_yaml::to_string(&Config::default()).context("Failed to render default config")?;
        fs::write(&config_path, yaml)
            .await
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
    }

    let db_path = medai_dir.join("medai.db");
    initialize_database(&database_url(&db_path.to_string_lossy()), None)
        .await
        .context("Failed to initialize database")?;

    let output_data = InitOutput {
        success: true,
        message: "Project initialized successfully.".to_string(),
        initialized_path: target_path,
        directories_created,
        config_written,
        database_initialized: true,
    };
    output(&output_data, json_mode);
    Ok(())
}
