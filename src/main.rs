//! MedAI Runner CLI entry point.

use clap::Parser;

use medai_runner::cli::{commands, handle_error, Cli, Commands};
use medai_runner::infrastructure::logging::{LogConfig, LoggerImpl};
use medai_runner::ConfigLoader;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    let config = match ConfigLoader::load() {
        Ok(config) => config,
        Err(err) => handle_error(err, json),
    };

    let mut log_config = LogConfig::from(&config.logging);
    if !cli.command.is_long_running() {
        log_config.level = "warn".to_string();
        log_config.log_dir = None;
    }
    let _logger = match LoggerImpl::init(&log_config) {
        Ok(logger) => logger,
        Err(err) => handle_error(err, json),
    };

    let result = match cli.command {
        Commands::Init(args) => commands::init::execute(args, json).await,
        Commands::Run(args) => commands::run::execute(args, &config, json).await,
        Commands::Tick(args) => commands::tick::execute(args, &config, json).await,
        Commands::Status(args) => commands::status::execute(args, &config, json).await,
        Commands::Model(args) => commands::model::execute(args, &config, json).await,
        Commands::Experiment(args) => commands::experiment::execute(args, &config, json).await,
    };

    if let Err(err) = result {
        handle_error(err, json);
    }
}
