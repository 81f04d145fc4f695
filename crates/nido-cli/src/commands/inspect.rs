//! Patch inspection command.

use crate::commands::common::load_patch;
use clap::Args;
use nido_config::Settings;
use nido_core::{ClientRole, ContextId, ContextRouter, PortDirection, PortType};
use std::path::PathBuf;

#[derive(Args)]
pub struct InspectArgs {
    /// Patch file to inspect
    pub file: PathBuf,

    /// Only show ports whose full name matches this regular expression
    #[arg(long, value_name = "REGEX")]
    ports: Option<String>,
}

pub fn run(args: InspectArgs, settings: &Settings) -> anyhow::Result<()> {
    let patch = load_patch(&args.file, settings)?;
    let router = &patch.router;

    println!("Patch: {}", args.file.display());
    println!();
    print_context(router, router.root(), 0)?;

    if let Some(pattern) = &args.ports {
        println!();
        println!("Ports matching '{pattern}':");
        for name in router.ports_in(router.root(), Some(pattern.as_str()), None, None)? {
            println!("  {name}");
        }
    }
    Ok(())
}

fn print_context(router: &ContextRouter, ctx: ContextId, depth: usize) -> anyhow::Result<()> {
    let indent = "  ".repeat(depth);
    println!(
        "{indent}{} {ctx}  {} Hz, {} frames",
        router.context_name(ctx)?,
        router.sample_rate(ctx)?,
        router.frames(ctx)?,
    );

    for client in router.clients(ctx)? {
        let role = match client.role {
            ClientRole::Plain => client.factory.clone().unwrap_or_else(|| "bare".to_owned()),
            ClientRole::Macro(child) => format!("macro of {child}"),
            ClientRole::Inlet => "inlet".to_owned(),
            ClientRole::Outlet => "outlet".to_owned(),
        };
        let state = if client.active { "" } else { " (inactive)" };
        println!("{indent}  {} [{role}]{state}", client.name);
        for port in &client.ports {
            let arrow = match port.direction {
                PortDirection::Input => "<-",
                PortDirection::Output => "->",
            };
            let kind = match port.port_type {
                PortType::Audio => "audio",
                PortType::Midi => "midi",
            };
            println!("{indent}    {arrow} {} ({kind})", port.short_name);
        }
        if let ClientRole::Macro(child) = client.role {
            print_context(router, child, depth + 2)?;
        }
    }

    let connections = router.connection_pairs(ctx)?;
    if !connections.is_empty() {
        println!("{indent}  connections:");
        for (output, input) in connections {
            println!("{indent}    {output} -> {input}");
        }
    }
    Ok(())
}
