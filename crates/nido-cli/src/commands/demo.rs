//! Demo patch builder.
//!
//! The demo patch feeds a constant `tone` through a `drive` gain into a
//! nested context `oversampled` running at twice the root rate. Inside, the
//! signal passes `shaper` and `trim` between the inlet and the outlet. The
//! nested output ends at a `monitor` thru client in the root.

use anyhow::Context as _;
use clap::Args;
use nido_config::{Settings, paths, persist};
use nido_core::ContextRouter;
use nido_registry::ClientRegistry;
use std::path::PathBuf;

/// Oversampling factor of the demo's nested context.
const DEMO_OVERSAMPLING: u32 = 2;

#[derive(Args)]
pub struct DemoArgs {
    /// Output patch file (defaults to demo.json in the user patches directory)
    #[arg(short, long, value_name = "FILE")]
    out: Option<PathBuf>,

    /// Level of the demo tone source
    #[arg(long, default_value_t = 0.5)]
    level: f32,
}

/// Builds the demo patch into `router`.
pub fn build(router: &mut ContextRouter, registry: &ClientRegistry, level: f32) -> anyhow::Result<()> {
    let tone = registry.create("constant", router, "tone")?;
    let drive = registry.create("gain", router, "drive")?;
    let monitor = registry.create("thru", router, "monitor")?;
    registry.levels().set(tone, level);
    registry.levels().set(drive, 2.0);
    for client in [tone, drive, monitor] {
        router.activate(client)?;
    }
    router.connect_by_name("tone:out", "drive:in")?;

    router.push("oversampled", DEMO_OVERSAMPLING)?;
    let shaper = registry.create("gain", router, "shaper")?;
    let trim = registry.create("gain", router, "trim")?;
    registry.levels().set(trim, 0.5);
    for client in [shaper, trim] {
        router.activate(client)?;
    }
    router.connect_by_name("inlet:audio_1", "shaper:in")?;
    router.connect_by_name("shaper:out", "trim:in")?;
    router.connect_by_name("trim:out", "outlet:audio_1")?;
    router.pop()?;

    router.connect_by_name("drive:out", "oversampled:inlet_audio_1")?;
    router.connect_by_name("oversampled:outlet_audio_1", "monitor:in")?;
    Ok(())
}

pub fn run(args: DemoArgs, settings: &Settings) -> anyhow::Result<()> {
    let out = match args.out {
        Some(path) => path,
        None => paths::ensure_user_patches_dir()?.join("demo.json"),
    };

    let (mut router, _engine) = ContextRouter::new(settings.engine_config());
    let registry = ClientRegistry::with_builtins();
    build(&mut router, &registry, args.level)?;
    persist::save_to_path(&router, &registry, router.root(), &out)
        .with_context(|| format!("saving demo patch to {}", out.display()))?;

    println!("Wrote demo patch to {}", out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nido_core::EngineConfig;

    #[test]
    fn test_demo_runs() {
        let (mut router, mut engine) = ContextRouter::new(EngineConfig::default());
        let registry = ClientRegistry::with_builtins();
        build(&mut router, &registry, 0.25).unwrap();
        engine.process(256).unwrap();
        assert_eq!(router.contexts().len(), 2);
        assert_eq!(router.connection_pairs(router.root()).unwrap().len(), 3);
    }
}
