//! Settings display command.

use anyhow::Context as _;
use clap::Args;
use nido_config::{Settings, paths};
use std::path::PathBuf;

#[derive(Args)]
pub struct SettingsArgs {
    /// Write the effective settings to the settings file
    #[arg(long)]
    write: bool,

    /// Reset to the built-in defaults before printing or writing
    #[arg(long)]
    defaults: bool,
}

pub fn run(args: SettingsArgs, settings: &Settings, path: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = if args.defaults {
        Settings::default()
    } else {
        settings.clone()
    };
    print!("{}", settings.to_toml()?);

    if args.write {
        let path = path.unwrap_or_else(paths::settings_path);
        settings
            .save(&path)
            .with_context(|| format!("writing settings to {}", path.display()))?;
        eprintln!("Wrote {}", path.display());
    }
    Ok(())
}
