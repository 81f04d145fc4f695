//! Real-time shadow of a context's client graph.
//!
//! The twin mirror holds exactly what the scheduler needs: active clients,
//! their ports, port buffers and connections. It is indexed by the same arena
//! slots as the control-plane graph, and every entry remembers the full
//! [`Key`] it was created for so events addressed to a stale generation are
//! ignored.
//!
//! Only the real-time thread touches a twin mirror. It changes solely through
//! [`TwinMirror::apply`], called while draining the change channel.

use crate::arena::Key;
use crate::bridge::BridgeLink;
use crate::buffer::PortBuffer;
use crate::channel::{GraphChange, Reclaimed, give_back};
use crate::graph::{ClientId, PortDirection, PortId};
use crate::process::ProcessHandler;
use crossbeam_channel::Sender;

/// Twin of an active client.
pub(crate) struct TwinClient {
    pub(crate) key: Key,
    pub(crate) id: ClientId,
    /// Port slots in registration order.
    pub(crate) ports: Vec<usize>,
    pub(crate) preserve_outputs: bool,
}

/// Twin of a port of an active client.
pub(crate) struct TwinPort {
    pub(crate) key: Key,
    pub(crate) id: PortId,
    pub(crate) client: usize,
    pub(crate) direction: PortDirection,
    /// Connected port slots in connection-insertion order.
    pub(crate) peers: Vec<usize>,
    /// Insertion rank of each entry of `peers`.
    ranks: Vec<u64>,
}

impl TwinPort {
    /// Adds a peer at its rank position. Equal ranks keep arrival order.
    fn add_peer(&mut self, peer: usize, rank: u64) {
        if self.peers.contains(&peer) {
            return;
        }
        let at = self.ranks.partition_point(|&r| r <= rank);
        self.peers.insert(at, peer);
        self.ranks.insert(at, rank);
    }

    fn remove_peer(&mut self, peer: usize) {
        if let Some(at) = self.peers.iter().position(|&p| p == peer) {
            self.peers.remove(at);
            self.ranks.remove(at);
        }
    }
}

/// Twin state of one context.
#[derive(Default)]
pub(crate) struct TwinMirror {
    pub(crate) clients: Vec<Option<TwinClient>>,
    pub(crate) handlers: Vec<Option<(Key, Box<dyn ProcessHandler>)>>,
    pub(crate) ports: Vec<Option<TwinPort>>,
    pub(crate) buffers: Vec<Option<Box<PortBuffer>>>,
    /// Active client slots in activation order.
    pub(crate) active: Vec<usize>,
    pub(crate) links: Vec<Box<BridgeLink>>,
    frames: usize,
}

fn slot<T>(slots: &mut Vec<Option<T>>, index: usize) -> &mut Option<T> {
    if slots.len() <= index {
        slots.resize_with(index + 1, || None);
    }
    &mut slots[index]
}

/// Diagnostic copy of a twin mirror's topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TwinSnapshot {
    /// Active clients in activation order.
    pub clients: Vec<ClientId>,
    /// Every `(output, input)` connection.
    pub connections: Vec<(PortId, PortId)>,
}

impl TwinMirror {
    pub(crate) fn new(frames: usize) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }

    pub(crate) fn frames(&self) -> usize {
        self.frames
    }

    /// Follows a frame-count change. Only allocates when buffers grow.
    pub(crate) fn set_frames(&mut self, frames: usize) {
        if frames == self.frames {
            return;
        }
        self.frames = frames;
        for buffer in self.buffers.iter_mut().flatten() {
            buffer.set_frames(frames);
        }
    }

    fn client_matches(&self, key: Key) -> bool {
        self.clients
            .get(key.index())
            .and_then(Option::as_ref)
            .is_some_and(|c| c.key == key)
    }

    fn port_matches(&self, key: Key) -> bool {
        self.ports
            .get(key.index())
            .and_then(Option::as_ref)
            .is_some_and(|p| p.key == key)
    }

    /// Applies one drained change.
    pub(crate) fn apply(&mut self, change: GraphChange, reclaim: &Sender<Reclaimed>) {
        match change {
            GraphChange::Activate {
                client,
                id,
                preserve_outputs,
            } => {
                let i = client.index();
                *slot(&mut self.clients, i) = Some(TwinClient {
                    key: client,
                    id,
                    ports: Vec::new(),
                    preserve_outputs,
                });
                if !self.active.contains(&i) {
                    self.active.push(i);
                }
                if let Some(Some((k, handler))) = self.handlers.get_mut(i)
                    && *k == client
                {
                    handler.activated();
                }
            }
            GraphChange::Deactivate { client } => {
                if !self.client_matches(client) {
                    return;
                }
                let i = client.index();
                let Some(twin) = self.clients[i].take() else {
                    return;
                };
                for &p in &twin.ports {
                    self.remove_port(p, reclaim);
                }
                self.active.retain(|&c| c != i);
                if let Some(Some((k, handler))) = self.handlers.get_mut(i)
                    && *k == client
                {
                    handler.deactivated();
                }
            }
            GraphChange::RegisterPort {
                port,
                client,
                id,
                direction,
                mut buffer,
            } => {
                if !self.client_matches(client) {
                    give_back(reclaim, Reclaimed::Buffer(id, buffer));
                    return;
                }
                buffer.set_frames(self.frames);
                let p = port.index();
                *slot(&mut self.ports, p) = Some(TwinPort {
                    key: port,
                    id,
                    client: client.index(),
                    direction,
                    peers: Vec::new(),
                    ranks: Vec::new(),
                });
                *slot(&mut self.buffers, p) = Some(buffer);
                if let Some(Some(c)) = self.clients.get_mut(client.index()) {
                    c.ports.push(p);
                }
            }
            GraphChange::UnregisterPort { port } => {
                if self.port_matches(port) {
                    self.remove_port(port.index(), reclaim);
                }
            }
            GraphChange::Connect {
                output,
                input,
                rank,
            } => {
                if !(self.port_matches(output) && self.port_matches(input)) {
                    return;
                }
                let (o, i) = (output.index(), input.index());
                if let Some(Some(out)) = self.ports.get_mut(o) {
                    out.add_peer(i, rank);
                }
                if let Some(Some(inp)) = self.ports.get_mut(i) {
                    inp.add_peer(o, rank);
                }
            }
            GraphChange::Disconnect { output, input } => {
                let (o, i) = (output.index(), input.index());
                if self.port_matches(output)
                    && let Some(Some(out)) = self.ports.get_mut(o)
                {
                    out.remove_peer(i);
                }
                if self.port_matches(input)
                    && let Some(Some(inp)) = self.ports.get_mut(i)
                {
                    inp.remove_peer(o);
                }
            }
            GraphChange::Rename { .. } => {}
            GraphChange::InstallHandler { client, handler } => {
                let active = self.client_matches(client);
                let entry = slot(&mut self.handlers, client.index());
                if let Some((_, mut old)) = entry.replace((client, handler)) {
                    old.deactivated();
                    give_back(reclaim, Reclaimed::Handler(old));
                }
                if active && let Some((_, handler)) = entry.as_mut() {
                    handler.activated();
                }
            }
            GraphChange::ReleaseHandler { client } => {
                let i = client.index();
                let matches = self
                    .handlers
                    .get(i)
                    .and_then(Option::as_ref)
                    .is_some_and(|(k, _)| *k == client);
                if matches && let Some((_, handler)) = self.handlers[i].take() {
                    give_back(reclaim, Reclaimed::Handler(handler));
                }
            }
            GraphChange::BridgeLink(link) => self.links.push(link),
        }
    }

    fn remove_port(&mut self, p: usize, reclaim: &Sender<Reclaimed>) {
        let Some(port) = self.ports.get_mut(p).and_then(Option::take) else {
            return;
        };
        for &peer in &port.peers {
            if let Some(Some(q)) = self.ports.get_mut(peer) {
                q.remove_peer(p);
            }
        }
        if let Some(Some(c)) = self.clients.get_mut(port.client) {
            c.ports.retain(|&x| x != p);
        }
        if let Some(buffer) = self.buffers.get_mut(p).and_then(Option::take) {
            give_back(reclaim, Reclaimed::Buffer(port.id, buffer));
        }
    }

    /// Buffer of a port twin, if `key` is current.
    #[cfg(test)]
    pub(crate) fn buffer(&self, key: Key) -> Option<&PortBuffer> {
        if !self.port_matches(key) {
            return None;
        }
        self.buffers.get(key.index())?.as_deref()
    }

    /// Copies the topology out for inspection. Allocates.
    pub(crate) fn snapshot(&self) -> TwinSnapshot {
        let clients = self
            .active
            .iter()
            .filter_map(|&i| self.clients.get(i).and_then(Option::as_ref).map(|c| c.id))
            .collect();
        let mut connections = Vec::new();
        for port in self.ports.iter().flatten() {
            if port.direction != PortDirection::Output {
                continue;
            }
            for &peer in &port.peers {
                if let Some(Some(input)) = self.ports.get(peer) {
                    connections.push((port.id, input.id));
                }
            }
        }
        TwinSnapshot {
            clients,
            connections,
        }
    }

    /// Sum of lost-event counters over every MIDI buffer.
    pub(crate) fn lost_midi_events(&self) -> usize {
        self.buffers
            .iter()
            .flatten()
            .filter_map(|b| b.as_midi())
            .map(|m| m.lost_count())
            .sum()
    }
}
