//! CLI command definitions and dispatch.

pub mod check;
pub mod plan;
pub mod run;

use std::path::Path;

use clap::{Parser, Subcommand};
use woodwork_common::config::{OrchestrationMode, RuntimeConfig};
use woodwork_common::constants::{APP_NAME, DEFAULT_CONFIG_FILE, WW_EXTENSION};
use woodwork_compose::graph::ComponentGraph;
use woodwork_runtime::engine::Engine;

use crate::builtins;

/// Woodwork — declarative component pipelines.
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Maximum lifecycle phases running on workers at once.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Force the sequential chain even if a message bus is declared.
    #[arg(long, global = true)]
    pub sequential: bool,

    /// Input that ends the main loop.
    #[arg(long, global = true)]
    pub exit_token: Option<String>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub json_logs: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse a .ww file and print the resolved graph as JSON.
    Check(check::CheckArgs),
    /// Show the start order, dependencies and backend of a .ww file.
    Plan(plan::PlanArgs),
    /// Build, start and run the pipeline of a .ww file.
    Run(run::RunArgs),
}

/// Arguments naming the configuration file.
#[derive(clap::Args, Debug)]
pub struct FileArgs {
    /// Path to the .ww configuration file.
    #[arg(default_value = DEFAULT_CONFIG_FILE)]
    pub file: String,
}

impl Cli {
    /// Runtime configuration from the environment, then command-line flags.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment override or flag is invalid.
    pub fn runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut config = RuntimeConfig::from_env()?;
        if let Some(workers) = self.workers {
            anyhow::ensure!(workers > 0, "--workers must be at least 1");
            config.workers = workers;
        }
        if let Some(token) = &self.exit_token {
            config.exit_token.clone_from(token);
        }
        if self.sequential {
            config.mode = Some(OrchestrationMode::Sequential);
        }
        Ok(config)
    }
}

/// Builds an engine with the built-in components and the CLI configuration.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn engine(cli: &Cli) -> anyhow::Result<Engine> {
    Ok(Engine::new(builtins::registry(), cli.runtime_config()?))
}

/// Loads `file`, with a hint when it does not exist.
///
/// # Errors
///
/// Returns an error if the file is missing or does not parse.
pub fn load(engine: &Engine, file: &str) -> anyhow::Result<ComponentGraph> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!(
            "Configuration file not found: {file}\n\
             Create a .ww file or specify a path: woodwork run <file>"
        );
    }
    if !has_ww_extension(path) {
        tracing::warn!(file, "configuration file does not end in {WW_EXTENSION}");
    }
    Ok(engine.load(path)?)
}

/// Returns `true` if `path` carries the configuration file extension.
pub fn has_ww_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| Some(ext) == WW_EXTENSION.strip_prefix('.'))
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let engine = engine(&cli)?;
    match cli.command {
        Command::Check(args) => check::execute(&engine, &args),
        Command::Plan(args) => plan::execute(&engine, &args),
        Command::Run(args) => run::execute(&engine, args).await,
    }
}
