//! `woodwork check` — Parse a configuration and print the resolved graph.

use clap::Args;
use woodwork_runtime::engine::Engine;

use super::FileArgs;

/// Arguments for the `check` command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub file: FileArgs,

    /// Print compact JSON on a single line.
    #[arg(long)]
    pub compact: bool,
}

/// Executes the `check` command.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not parse.
pub fn execute(engine: &Engine, args: &CheckArgs) -> anyhow::Result<()> {
    let graph = super::load(engine, &args.file.file)?;
    let json = if args.compact {
        serde_json::to_string(&graph)?
    } else {
        serde_json::to_string_pretty(&graph)?
    };
    println!("{json}");
    Ok(())
}
