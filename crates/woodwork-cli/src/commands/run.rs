//! `woodwork run` — Build, start and run the pipeline.

use std::io::Write;
use std::time::Instant;

use clap::Args;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use woodwork_common::constants::MESSAGE_BUS_KIND;
use woodwork_common::types::ProgressUpdate;
use woodwork_runtime::engine::Engine;
use woodwork_runtime::progress::{self, ProgressTracker};

use super::FileArgs;
use crate::output::{BOLD, DIM, GREEN, RED, RESET, format_duration, progress_bar, summary_lines};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub file: FileArgs,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    pub json: bool,

    /// Do not render lifecycle progress.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Executes the `run` command.
///
/// Renders bring-up progress on stderr, runs the selected backend until the
/// exit token, the end of input or Ctrl+C, then reports the summary.
///
/// # Errors
///
/// Returns an error if loading, construction, bring-up or the run fails.
pub async fn execute(engine: &Engine, args: RunArgs) -> anyhow::Result<()> {
    let total_start = Instant::now();
    let graph = super::load(engine, &args.file.file)?;

    eprintln!();
    eprintln!("  {BOLD}Woodwork{RESET} {DIM}v{}{RESET}", env!("CARGO_PKG_VERSION"));
    eprintln!();

    let (tx, rx) = progress::channel();
    let names: Vec<String> = graph
        .iter()
        .filter(|d| d.component != MESSAGE_BUS_KIND)
        .map(|d| d.variable.clone())
        .collect();
    let render = tokio::spawn(render_progress(ProgressTracker::new(names), rx, args.quiet));

    let shutdown = CancellationToken::new();
    let interrupt = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                eprintln!("  Stopping...");
                shutdown.cancel();
            }
        })
    };

    let result = engine.run(&graph, Some(tx), shutdown).await;
    interrupt.abort();
    if let Err(e) = render.await {
        tracing::debug!(error = %e, "progress renderer ended early");
    }
    let summary = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    eprintln!();
    eprintln!("  {GREEN}{BOLD}Finished{RESET} in {}:", format_duration(total_start.elapsed()));
    for line in summary_lines(&summary) {
        eprintln!("    {line}");
    }
    Ok(())
}

async fn render_progress(mut tracker: ProgressTracker, mut rx: UnboundedReceiver<ProgressUpdate>, quiet: bool) {
    let mut stderr = std::io::stderr();
    while let Some(update) = rx.recv().await {
        tracker.apply(&update);
        if quiet {
            continue;
        }
        let _ = write!(stderr, "\r  Starting {} {DIM}{}{RESET}\x1b[K", progress_bar(tracker.aggregate()), update.component);
        let _ = stderr.flush();
    }
    if quiet || tracker.iter().next().is_none() {
        return;
    }
    let _ = writeln!(stderr, "\r  Started  {}\x1b[K", progress_bar(tracker.aggregate()));
    for name in tracker.failed() {
        let state = tracker.get(name).map(|p| p.state.to_string()).unwrap_or_default();
        let _ = writeln!(stderr, "    {RED}x{RESET} {BOLD}{name}{RESET} {DIM}{state}{RESET}");
    }
}
