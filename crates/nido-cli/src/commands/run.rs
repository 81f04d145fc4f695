//! Patch processing command, offline or on a live host thread.

use crate::commands::common::load_patch;
use clap::Args;
use nido_config::Settings;
use nido_core::{ContextRouter, HostThread, RtEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How often the live loop checks for Ctrl+C and the time limit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Args)]
pub struct RunArgs {
    /// Patch file to run
    pub file: PathBuf,

    /// Number of cycles to run offline
    #[arg(short, long, default_value_t = 100)]
    cycles: usize,

    /// Frames per cycle (defaults to the configured frame count)
    #[arg(short, long)]
    frames: Option<usize>,

    /// Run on a host thread at the configured sample rate until Ctrl+C
    #[arg(long)]
    live: bool,

    /// Stop a live run after this many seconds
    #[arg(long, requires = "live")]
    seconds: Option<f64>,
}

pub fn run(args: RunArgs, settings: &Settings) -> anyhow::Result<()> {
    let frames = args.frames.unwrap_or(settings.frames);
    if frames == 0 {
        anyhow::bail!("frames must be at least 1");
    }
    let patch = load_patch(&args.file, settings)?;
    let clients = patch.report.clients.len();
    let contexts = patch.router.contexts().len();

    println!("Patch:        {}", args.file.display());
    println!("Clients:      {clients}");
    println!("Contexts:     {contexts}");

    if args.live {
        run_live(patch.router, patch.engine, frames, settings.sample_rate, args.seconds)
    } else {
        run_offline(patch.router, patch.engine, frames, args.cycles, settings.sample_rate);
        Ok(())
    }
}

fn run_offline(
    mut router: ContextRouter,
    mut engine: RtEngine,
    frames: usize,
    cycles: usize,
    sample_rate: f32,
) {
    let mut failures = 0usize;
    let mut lost = 0usize;
    for cycle in 0..cycles {
        // a large patch may still be waiting for room on the change channel
        router.flush();
        if let Err(e) = engine.process(frames) {
            failures += 1;
            tracing::warn!(cycle, error = %e, "cycle failed");
        }
        lost += engine.lost_midi_events();
    }

    let seconds = (cycles * frames) as f64 / f64::from(sample_rate);
    println!("Cycles:       {cycles} x {frames} frames ({seconds:.3}s)");
    println!("Failures:     {failures}");
    println!("Lost MIDI:    {lost}");
}

fn run_live(
    mut router: ContextRouter,
    engine: RtEngine,
    frames: usize,
    sample_rate: f32,
    seconds: Option<f64>,
) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        println!("\nStopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    let period = Duration::from_secs_f64(frames as f64 / f64::from(sample_rate));
    let limit = seconds.map(Duration::from_secs_f64);
    let started = Instant::now();
    let host = HostThread::spawn(engine, frames, period);
    router.flush();
    tracing::info!(frames, period_us = period.as_micros() as u64, "live host started");

    while running.load(Ordering::SeqCst) && limit.is_none_or(|limit| started.elapsed() < limit) {
        std::thread::sleep(POLL_INTERVAL);
    }

    let cycles = host.cycles();
    let failures = host.failures();
    host.stop();
    println!(
        "Cycles:       {cycles} x {frames} frames ({:.3}s)",
        started.elapsed().as_secs_f64()
    );
    println!("Failures:     {failures}");
    Ok(())
}
