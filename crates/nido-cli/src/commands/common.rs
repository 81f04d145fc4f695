//! Shared helpers for CLI commands.

use anyhow::Context as _;
use nido_config::{LoadReport, Settings, paths, persist};
use nido_core::{ContextRouter, RtEngine};
use nido_registry::ClientRegistry;
use std::path::Path;

/// Loads settings from `path`, or from the user settings file when it exists.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    match path {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(Settings::load_or_default(paths::settings_path())?),
    }
}

/// A router with a patch loaded into its root context.
pub struct LoadedPatch {
    pub router: ContextRouter,
    pub engine: RtEngine,
    pub report: LoadReport,
}

/// Loads a patch file into a fresh router.
pub fn load_patch(path: &Path, settings: &Settings) -> anyhow::Result<LoadedPatch> {
    let (mut router, engine) = ContextRouter::new(settings.engine_config());
    let registry = ClientRegistry::with_builtins();
    let report = persist::load_from_path(&mut router, &registry, path)
        .with_context(|| format!("loading patch {}", path.display()))?;
    for name in &report.skipped_clients {
        eprintln!("warning: skipped client '{name}' (unknown factory)");
    }
    for (output, input) in &report.skipped_connections {
        eprintln!("warning: skipped connection {output} -> {input}");
    }
    Ok(LoadedPatch {
        router,
        engine,
        report,
    })
}
