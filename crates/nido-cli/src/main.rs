//! nido CLI - offline host for nested routing contexts.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nido")]
#[command(author, version, about = "Nested audio/MIDI routing host", long_about = None)]
struct Cli {
    /// Settings file (defaults to the user settings file, if present)
    #[arg(long, global = true, value_name = "FILE")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and save a demo patch
    Demo(commands::demo::DemoArgs),

    /// Print the contexts, clients and connections of a patch
    Inspect(commands::inspect::InspectArgs),

    /// Load a patch and run offline cycles
    Run(commands::run::RunArgs),

    /// Show or write the effective settings
    Settings(commands::settings::SettingsArgs),

    /// List the built-in client factories
    Factories,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = commands::common::load_settings(cli.settings.as_deref())?;

    match cli.command {
        Commands::Demo(args) => commands::demo::run(args, &settings),
        Commands::Inspect(args) => commands::inspect::run(args, &settings),
        Commands::Run(args) => commands::run::run(args, &settings),
        Commands::Settings(args) => commands::settings::run(args, &settings, cli.settings),
        Commands::Factories => commands::factories::run(),
    }
}
