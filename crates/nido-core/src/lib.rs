//! Nido Core - nested virtual audio/MIDI routing
//!
//! This crate is an in-process routing engine in the style of a sound server:
//! clients own typed, directed ports, ports are wired into a graph, and one
//! processing cycle runs every active client's callback in dependency order.
//! Contexts nest: a whole routing graph can be packaged as a single *macro
//! client* of its parent and run at an integer multiple of the parent's rate.
//!
//! # Core Abstractions
//!
//! ## Control plane
//!
//! - [`ContextRouter`] - Owns every context; all topology changes go through it
//! - [`ClientGraph`] - Clients, ports and connections of one context
//! - [`EngineConfig`] - Name limits, buffer sizes, channel capacities
//!
//! ## Real-time plane
//!
//! - [`RtEngine`] - A context's process callback: drains changes, runs the cycle
//! - [`ProcessHandler`] - Per-client callback, with [`ProcessScope`] for buffer access
//! - [`HostThread`] - Drives a root engine from a background thread
//!
//! ## Buffers
//!
//! - [`AudioBuffer`] - One cycle of `f32` samples
//! - [`MidiBuffer`] - Fixed-capacity, time-ordered MIDI event storage
//! - [`MidiMerger`] - Timestamp-ordered merge of several MIDI sources
//!
//! ## Nesting
//!
//! - [`BridgeSide`], [`BridgePort`] - The inlet/outlet pair inside a nested context
//! - [`Resampler`] - Rate conversion at the bridge
//!
//! # Threading
//!
//! Each context has a control half and a real-time half. The control half
//! validates and applies every change to its graph, then sends the matching
//! events over a bounded channel and waits until the real-time thread reports
//! them applied. The real-time half never allocates in a steady-state cycle;
//! everything it lets go of is handed back and freed on the control thread.
//!
//! # Example
//!
//! ```
//! use nido_core::{
//!     ContextRouter, EngineConfig, NamePolicy, PortDirection, PortType, ProcessError, ProcessScope,
//! };
//!
//! let (mut router, mut engine) = ContextRouter::new(EngineConfig::default());
//! let tone = router.open_client("tone", NamePolicy::Exact).unwrap();
//! let out = router
//!     .register_port(tone, "out", PortType::Audio, PortDirection::Output)
//!     .unwrap();
//! router
//!     .set_process_handler(tone, move |scope: &mut ProcessScope<'_>| -> Result<(), ProcessError> {
//!         if let Some(buf) = scope.audio_mut(out) {
//!             buf.fill(0.25);
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//! router.activate(tone).unwrap();
//! engine.process(64).unwrap();
//! ```
//!
//! # Features
//!
//! - `tracing` - structured logs of topology changes and cycle failures
//! - `serde` - serialization of the plain enums used in saved patches

mod arena;
pub mod bridge;
pub mod buffer;
mod channel;
pub mod config;
mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod host;
pub mod process;
pub mod resample;
pub mod router;
mod scheduler;
mod twin;

// Re-export main types at crate root
pub use bridge::{BridgePort, BridgeSide, derived_port_name, free_port_name};
pub use buffer::{AudioBuffer, MidiBuffer, MidiEvent, MidiMerger, MidiOverflow, PortBuffer};
pub use channel::Rendezvous;
pub use config::{EngineConfig, MAX_CONTEXT_FRAMES, MAX_OVERSAMPLING, UpsampleMode};
pub use engine::RtEngine;
pub use error::{CycleError, EngineError, ProcessError, Result};
pub use graph::{
    ClientGraph, ClientId, ClientInfo, ClientRole, NamePolicy, PortDirection, PortId, PortInfo,
    PortType,
};
pub use host::HostThread;
pub use process::{ProcessHandler, ProcessScope};
pub use resample::{DECIMATION_TAPS, Resampler};
pub use router::{ContextId, ContextRouter};
pub use twin::TwinSnapshot;
