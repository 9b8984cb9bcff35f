//! Model, eval job and classifier registration.

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{list_table, output, render_list, CommandOutput};
use crate::cli::runtime::open_store;
use crate::domain::models::{Config, EvalJob, Model, ModelId};

/// Arguments of `model`.
#[derive(Args, Debug)]
pub struct ModelArgs {
    /// Model subcommand.
    #[command(subcommand)]
    pub command: ModelCommand,
}

/// Model and eval job management.
#[derive(Subcommand, Debug)]
pub enum ModelCommand {
    /// Register an inference model image
    Add {
        /// Container image reference
        image: String,

        /// Name shown to operators
        #[arg(long)]
        name: String,

        /// Study type the model evaluates
        #[arg(long)]
        input_type: String,

        /// DICOM modality of accepted studies
        #[arg(long)]
        modality: String,

        /// The model writes an output image
        #[arg(long)]
        image_output: bool,

        /// Maximum simultaneous dispatch units
        #[arg(long, default_value = "1")]
        concurrency: u32,
    },

    /// List registered models
    List,

    /// Create or replace the eval job of a model
    Job {
        /// Model to evaluate with
        model_id: i64,

        /// Studies selected per cycle
        #[arg(long, default_value = "1")]
        batch_size: u32,

        /// Warm worker replicas; 0 dispatches on demand
        #[arg(long, default_value = "0")]
        replicas: u32,

        /// Run without GPUs
        #[arg(long)]
        cpu: bool,

        /// Create the job paused
        #[arg(long)]
        paused: bool,

        /// Purge evaluated studies from the archive
        #[arg(long)]
        delete_from_archive: bool,
    },

    /// Make a model the classifier for a modality
    Classifier {
        /// DICOM modality to classify
        modality: String,
        /// Classifier model id
        model_id: i64,
    },
}

/// Output of `model list`.
#[derive(Debug, Serialize)]
pub struct ModelListOutput {
    /// Registered models.
    pub models: Vec<Model>,
}

impl CommandOutput for ModelListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["id", "name", "input type", "modality", "image"]);
        for model in &self.models {
            table.add_row(vec![
                model.id.to_string(),
                model.display_name.clone(),
                model.input_type.clone(),
                model.modality.clone(),
                model.image.clone(),
            ]);
        }
        render_list("model", &table, self.models.len())
    }
}

/// Result of a model mutation.
#[derive(Debug, Serialize)]
pub struct ModelOutput {
    /// Summary line.
    pub message: String,
    /// Model acted on.
    pub model_id: i64,
}

impl CommandOutput for ModelOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

/// Run a `model` subcommand.
pub async fn execute(args: ModelArgs, config: &Config, json_mode: bool) -> Result<()> {
    let store = open_store(config).await?;

    match args.command {
        ModelCommand::Add {
            image,
            name,
            input_type,
            modality,
            image_output,
            concurrency,
        } => {
            if concurrency == 0 {
                bail!("Concurrency must be at least 1");
            }
            let model = store
                .models
                .create_model(&Model {
                    id: ModelId(0),
                    image,
                    display_name: name,
                    input_type,
                    modality,
                    has_image_output: image_output,
                    concurrency,
                })
                .await?;
            output(
                &ModelOutput {
                    message: format!("Registered model {} ({})", model.id, model.display_name),
                    model_id: model.id.get(),
                },
                json_mode,
            );
        }
        ModelCommand::List => {
            let models = store.models.list_models().await?;
            output(&ModelListOutput { models }, json_mode);
        }
        ModelCommand::Job {
            model_id,
            batch_size,
            replicas,
            cpu,
            paused,
            delete_from_archive,
        } => {
            let model_id = ModelId(model_id);
            if store.models.get_model(model_id).await?.is_none() {
                bail!("Model not found: {model_id}");
            }
            if batch_size == 0 {
                bail!("Batch size must be at least 1");
            }
            let job = store
                .models
                .upsert_job(&EvalJob {
                    batch_size,
                    running: !paused,
                    cpu,
                    replicas,
                    delete_from_archive,
                    ..EvalJob::new(model_id)
                })
                .await?;
            output(
                &ModelOutput {
                    message: format!(
                        "Eval job for model {model_id}: {} batch {}",
                        job.dispatch_mode().as_str(),
                        job.batch_size
                    ),
                    model_id: model_id.get(),
                },
                json_mode,
            );
        }
        ModelCommand::Classifier { modality, model_id } => {
            let model_id = ModelId(model_id);
            store.models.set_classifier(&modality, model_id).await?;
            output(
                &ModelOutput {
                    message: format!("Model {model_id} classifies {modality} studies"),
                    model_id: model_id.get(),
                },
                json_mode,
            );
        }
    }
    Ok(())
}
