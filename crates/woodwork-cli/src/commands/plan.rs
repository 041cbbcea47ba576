//! `woodwork plan` — Display how a configuration would be brought up.

use clap::Args;
use woodwork_common::constants::MESSAGE_BUS_KIND;
use woodwork_runtime::engine::Engine;

use super::FileArgs;
use crate::output::{BOLD, DIM, GREEN, RESET, YELLOW, rule};

/// Arguments for the `plan` command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub file: FileArgs,
}

/// Executes the `plan` command.
///
/// Parses the file, derives the run settings and prints every component in
/// start order with what it depends on and whether a factory is known for it.
///
/// # Errors
///
/// Returns an error if parsing or settings resolution fails.
pub fn execute(engine: &Engine, args: &PlanArgs) -> anyhow::Result<()> {
    let graph = super::load(engine, &args.file.file)?;
    let settings = engine.settings(&graph)?;
    let order = graph.resolve_order()?;

    println!("Run Plan for: {}", args.file.file);
    println!("{}", rule(35));
    println!();

    let mut components = 0_usize;
    for name in &order {
        let Some(decl) = graph.get(name) else {
            continue;
        };
        if decl.component == MESSAGE_BUS_KIND {
            continue;
        }
        components += 1;
        let known = if engine.registry().contains(&decl.component, &decl.component_type) {
            format!("{GREEN}builtin{RESET}")
        } else {
            format!("{YELLOW}no factory{RESET}")
        };
        println!("  + {BOLD}{name}{RESET} {DIM}{} {}{RESET} [{known}]", decl.component, decl.component_type);
        let deps = graph.dependencies(name);
        if !deps.is_empty() {
            println!("      after: {}", deps.join(", "));
        }
    }

    println!();
    println!("  {components} component(s) will be started.");
    println!("  backend: {BOLD}{}{RESET}", engine.backend(&settings).name());
    println!("  workers: {}", settings.workers);
    if let Some(input) = &settings.bus.input {
        println!("  input:   {input}");
    }
    Ok(())
}
