//! Per-cycle, demand-driven evaluation of a twin mirror.
//!
//! Every cycle starts with all active clients unvisited. For each one, in
//! activation order, the scheduler first visits every client feeding one of
//! its inputs, merges the input from its connected outputs, clears the
//! client's outputs and runs its handler. This is a depth-first topological
//! walk recomputed each cycle, so topology changes need no schedule rebuild.
//!
//! Visit state and the MIDI merge scratch live in the scheduler and only grow
//! when the topology does, so a steady-state cycle performs no allocation.

use crate::buffer::{MidiMerger, PortBuffer};
use crate::error::{CycleError, ProcessError};
use crate::graph::PortDirection;
use crate::process::ProcessScope;
use crate::twin::TwinMirror;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Pending,
    InProgress,
    Done,
}

/// Runs one context's clients in dependency order.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    visits: Vec<Visit>,
    merger: MidiMerger,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Grows scratch state to fit the twin mirror's current topology.
    pub(crate) fn fit(&mut self, twin: &TwinMirror, midi_events_per_port: usize) {
        if self.visits.len() < twin.clients.len() {
            self.visits.resize(twin.clients.len(), Visit::Pending);
        }
        let widest = twin
            .ports
            .iter()
            .flatten()
            .filter(|p| p.direction == PortDirection::Input)
            .map(|p| p.peers.len())
            .max()
            .unwrap_or(0);
        self.merger.reserve(widest * midi_events_per_port);
    }

    /// Runs every active client once.
    ///
    /// Stops at the first failing handler; later clients keep last cycle's
    /// output.
    pub(crate) fn run(&mut self, twin: &mut TwinMirror, frames: usize) -> Result<(), CycleError> {
        self.visits.fill(Visit::Pending);
        for n in 0..twin.active.len() {
            let c = twin.active[n];
            self.visit(twin, c, frames)?;
        }
        Ok(())
    }

    fn visit(&mut self, twin: &mut TwinMirror, c: usize, frames: usize) -> Result<(), CycleError> {
        match self.visits.get(c) {
            Some(Visit::Pending) => {}
            // Done, or re-entered through a cycle: treat as processed.
            _ => return Ok(()),
        }
        self.visits[c] = Visit::InProgress;

        let port_count = twin.clients[c].as_ref().map_or(0, |cl| cl.ports.len());
        for n in 0..port_count {
            let Some(p) = twin.clients[c].as_ref().and_then(|cl| cl.ports.get(n).copied()) else {
                continue;
            };
            let peer_count = match twin.ports[p].as_ref() {
                Some(port) if port.direction == PortDirection::Input => port.peers.len(),
                _ => continue,
            };
            for m in 0..peer_count {
                let owner = twin.ports[p]
                    .as_ref()
                    .and_then(|port| port.peers.get(m))
                    .and_then(|&peer| twin.ports.get(peer))
                    .and_then(Option::as_ref)
                    .map(|peer| peer.client);
                if let Some(owner) = owner {
                    self.visit(twin, owner, frames)?;
                }
            }
            self.merge_input(twin, p);
        }

        clear_outputs(twin, c);
        let result = invoke(twin, c, frames);
        self.visits[c] = Visit::Done;
        result
    }

    /// Fills input `p` from its connected outputs.
    fn merge_input(&mut self, twin: &mut TwinMirror, p: usize) {
        let Some(mut dst) = twin.buffers[p].take() else {
            return;
        };
        let buffers = &twin.buffers;
        let peers: &[usize] = twin.ports[p]
            .as_ref()
            .map_or(&[][..], |port| port.peers.as_slice());
        match &mut *dst {
            PortBuffer::Audio(audio) => {
                audio.clear();
                for &s in peers {
                    if let Some(Some(src)) = buffers.get(s)
                        && let PortBuffer::Audio(src) = &**src
                    {
                        audio.accumulate_from(src);
                    }
                }
            }
            PortBuffer::Midi(midi) => {
                self.merger.merge(midi, peers.len(), |i| {
                    peers
                        .get(i)
                        .and_then(|&s| buffers.get(s))
                        .and_then(Option::as_deref)
                        .and_then(PortBuffer::as_midi)
                });
            }
        }
        twin.buffers[p] = Some(dst);
    }
}

/// Zeroes audio outputs and clears MIDI outputs before the handler runs.
fn clear_outputs(twin: &mut TwinMirror, c: usize) {
    let Some(client) = twin.clients[c].as_ref() else {
        return;
    };
    if client.preserve_outputs {
        return;
    }
    for &p in &client.ports {
        let is_output = twin.ports[p]
            .as_ref()
            .is_some_and(|port| port.direction == PortDirection::Output);
        if is_output && let Some(Some(buffer)) = twin.buffers.get_mut(p) {
            buffer.reset();
        }
    }
}

fn invoke(twin: &mut TwinMirror, c: usize, frames: usize) -> Result<(), CycleError> {
    let TwinMirror {
        clients,
        handlers,
        ports,
        buffers,
        ..
    } = twin;
    let Some(client) = clients[c].as_ref() else {
        return Ok(());
    };
    let Some(Some((key, handler))) = handlers.get_mut(c) else {
        return Ok(());
    };
    if *key != client.key {
        return Ok(());
    }
    let mut scope = ProcessScope::new(frames, client.id, &client.ports, ports, buffers);
    handler
        .process(&mut scope)
        .map_err(|ProcessError(code)| CycleError::ClientFailed {
            client: client.id,
            code,
        })
}
