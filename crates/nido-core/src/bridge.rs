//! Interface bridges between a nested context and its parent.
//!
//! Pushing a context creates, inside the child, two bridge clients:
//!
//! - the **inlet**, whose output ports carry parent data into the child;
//! - the **outlet**, whose input ports carry child data back out.
//!
//! In the parent the child appears as one *macro client*. Its process handler
//! ([`MacroHandler`]) owns the child's [`RtEngine`] and runs one child cycle
//! of `frames × factor` frames per parent cycle.
//!
//! # Port pool
//!
//! Each bridge client always exposes at least one free (never connected)
//! audio port and one free MIDI port, named `audio_<n>` / `midi_<n>`. The
//! first connection to a free port links it: the macro client gets a port of
//! the opposite direction named `<bridge client>_<port>`, the pair is handed
//! to the child engine as a [`BridgeLink`], and a fresh free port replaces the
//! one just used.
//!
//! # Rate conversion
//!
//! Audio entering the child is upsampled (hold or linear), audio leaving it is
//! low-pass filtered and decimated. MIDI timestamps are multiplied on the way
//! in and divided on the way out.

use crate::arena::Key;
use crate::buffer::{MidiBuffer, PortBuffer};
use crate::engine::RtEngine;
use crate::error::{CycleError, ProcessError};
use crate::graph::{ClientId, PortDirection, PortId, PortType};
use crate::process::{ProcessHandler, ProcessScope};
use crate::resample::Resampler;
use crate::router::ContextId;
use crate::twin::TwinPort;

/// Which bridge client of a nested context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeSide {
    /// Carries data into the child.
    Inlet,
    /// Carries data out of the child.
    Outlet,
}

impl BridgeSide {
    /// Direction of the bridge client's ports inside the child.
    pub fn child_direction(self) -> PortDirection {
        match self {
            BridgeSide::Inlet => PortDirection::Output,
            BridgeSide::Outlet => PortDirection::Input,
        }
    }
}

/// A linked bridge port as seen by queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePort {
    /// Which bridge client owns the child-side port.
    pub side: BridgeSide,
    /// Short name of the child-side port.
    pub short_name: String,
    /// Data type.
    pub port_type: PortType,
    /// Child-side port.
    pub child_port: PortId,
    /// Paired port on the macro client.
    pub parent_port: PortId,
}

/// Name of the next free bridge port of `port_type`.
pub fn free_port_name<'a>(port_type: PortType, existing: impl IntoIterator<Item = &'a str>) -> String {
    let prefix = match port_type {
        PortType::Audio => "audio_",
        PortType::Midi => "midi_",
    };
    let next = existing
        .into_iter()
        .filter_map(|name| name.strip_prefix(prefix)?.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1;
    format!("{prefix}{next}")
}

/// Name of the macro-client port paired with a bridge port.
pub fn derived_port_name(bridge_client: &str, short_name: &str) -> String {
    format!("{bridge_client}_{short_name}")
}

/// Control-plane record of one linked pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkRecord {
    pub(crate) side: BridgeSide,
    pub(crate) lower: PortId,
    pub(crate) upper: PortId,
}

/// Control-plane state of a nested context's bridge.
#[derive(Debug, Clone)]
pub(crate) struct InterfaceBridge {
    pub(crate) parent: ContextId,
    pub(crate) macro_client: ClientId,
    pub(crate) inlet: ClientId,
    pub(crate) outlet: ClientId,
    pub(crate) factor: usize,
    pub(crate) links: Vec<LinkRecord>,
}

impl InterfaceBridge {
    /// Bridge side owning `client`, if it is a bridge client.
    pub(crate) fn side_of(&self, client: ClientId) -> Option<BridgeSide> {
        if client == self.inlet {
            Some(BridgeSide::Inlet)
        } else if client == self.outlet {
            Some(BridgeSide::Outlet)
        } else {
            None
        }
    }

    pub(crate) fn client_of(&self, side: BridgeSide) -> ClientId {
        match side {
            BridgeSide::Inlet => self.inlet,
            BridgeSide::Outlet => self.outlet,
        }
    }

    pub(crate) fn is_linked(&self, port: PortId) -> bool {
        self.links.iter().any(|l| l.lower == port)
    }

    pub(crate) fn is_parent_port(&self, port: PortId) -> bool {
        self.links.iter().any(|l| l.upper == port)
    }
}

/// Direction of data through a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    IntoChild,
    OutOfChild,
}

/// Real-time pairing of a child-side bridge port with its macro-client port.
pub(crate) struct BridgeLink {
    /// Port slot in the child twin.
    pub(crate) lower: Key,
    /// Port slot in the parent twin.
    pub(crate) upper: Key,
    pub(crate) flow: Flow,
    pub(crate) resampler: Resampler,
}

impl BridgeLink {
    pub(crate) fn new(lower: Key, upper: Key, side: BridgeSide, resampler: Resampler) -> Self {
        let flow = match side {
            BridgeSide::Inlet => Flow::IntoChild,
            BridgeSide::Outlet => Flow::OutOfChild,
        };
        Self {
            lower,
            upper,
            flow,
            resampler,
        }
    }

    /// Moves one cycle of data across the rate boundary.
    fn transfer(&mut self, src: &PortBuffer, dst: &mut PortBuffer) {
        let factor = self.resampler.factor() as u32;
        match (src, dst) {
            (PortBuffer::Audio(s), PortBuffer::Audio(d)) => match self.flow {
                Flow::IntoChild => self.resampler.upsample(s.as_slice(), d.as_mut_slice()),
                Flow::OutOfChild => self.resampler.downsample(s.as_slice(), d.as_mut_slice()),
            },
            (PortBuffer::Midi(s), PortBuffer::Midi(d)) => match self.flow {
                Flow::IntoChild => rescale_midi(s, d, |t| t.saturating_mul(factor)),
                Flow::OutOfChild => rescale_midi(s, d, |t| t / factor),
            },
            _ => {}
        }
    }
}

/// Copies every event of `src` into a cleared `dst` with a new timestamp.
fn rescale_midi(src: &MidiBuffer, dst: &mut MidiBuffer, scale: impl Fn(u32) -> u32) {
    dst.clear();
    for event in src.iter() {
        // overflow is counted in dst
        let _ = dst.write(scale(event.time), event.bytes);
    }
}

fn child_buffer<'a>(
    ports: &[Option<TwinPort>],
    buffers: &'a [Option<Box<PortBuffer>>],
    key: Key,
) -> Option<&'a PortBuffer> {
    let current = ports
        .get(key.index())
        .and_then(Option::as_ref)
        .is_some_and(|p| p.key == key);
    if !current {
        return None;
    }
    buffers.get(key.index())?.as_deref()
}

fn child_buffer_mut<'a>(
    ports: &[Option<TwinPort>],
    buffers: &'a mut [Option<Box<PortBuffer>>],
    key: Key,
) -> Option<&'a mut PortBuffer> {
    let current = ports
        .get(key.index())
        .and_then(Option::as_ref)
        .is_some_and(|p| p.key == key);
    if !current {
        return None;
    }
    buffers.get_mut(key.index())?.as_deref_mut()
}

/// Process handler of a macro client: one child cycle per parent cycle.
pub(crate) struct MacroHandler {
    engine: RtEngine,
    factor: usize,
}

impl MacroHandler {
    pub(crate) fn new(engine: RtEngine, factor: usize) -> Self {
        Self {
            engine,
            factor: factor.max(1),
        }
    }
}

impl ProcessHandler for MacroHandler {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Result<(), ProcessError> {
        let inner = scope.frames() * self.factor;
        self.engine.begin_cycle(inner);

        let twin = &mut self.engine.twin;
        for link in &mut twin.links {
            if link.flow != Flow::IntoChild {
                continue;
            }
            let Some(src) = scope.buffer_by_key(link.upper) else {
                continue;
            };
            if let Some(dst) = child_buffer_mut(&twin.ports, &mut twin.buffers, link.lower) {
                link.transfer(src, dst);
            }
        }

        self.engine
            .scheduler
            .run(&mut self.engine.twin, inner)
            .map_err(|CycleError::ClientFailed { code, .. }| ProcessError(code))?;

        let twin = &mut self.engine.twin;
        for link in &mut twin.links {
            if link.flow != Flow::OutOfChild {
                continue;
            }
            let Some(src) = child_buffer(&twin.ports, &twin.buffers, link.lower) else {
                continue;
            };
            if let Some(dst) = scope.buffer_by_key_mut(link.upper) {
                link.transfer(src, dst);
            }
        }
        Ok(())
    }

    fn activated(&mut self) {
        self.engine.set_live(true);
    }

    fn deactivated(&mut self) {
        self.engine.set_live(false);
    }
}
