//! Control-plane registry of clients, ports and connections.
//!
//! A [`ClientGraph`] is the authoritative topology of one context. Every
//! mutation validates first and changes nothing on failure. Mutations that the
//! real-time thread must see push [`GraphChange`]s onto the caller's batch;
//! the owning context submits that batch through its change channel. Queries
//! read only this structure and never touch the channel.
//!
//! # Naming
//!
//! - Client names are unique per context, at most `max_client_name` bytes.
//! - Port names are unique per client; the full `client:short` name is at most
//!   `max_port_name` bytes.
//! - Neither may be empty or contain `:`.
//!
//! # Cycles
//!
//! Connecting an output of client A to an input of client B adds the edge
//! A → B to the induced client graph. The connection is rejected with
//! `CycleDetected` if B can already reach A (or A is B).

mod client;
mod port;

pub use client::{ClientId, ClientInfo, ClientRole, NamePolicy};
pub use port::{PortDirection, PortId, PortInfo, PortType};

pub(crate) use client::Client;
pub(crate) use port::Port;

use crate::arena::{Arena, Key};
use crate::buffer::PortBuffer;
use crate::channel::GraphChange;
use crate::error::{EngineError, Result};
use crate::process::ProcessHandler;
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// Sizes used when allocating buffers for newly visible ports.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferSpec {
    pub(crate) frames: usize,
    pub(crate) midi_bytes: usize,
}

impl BufferSpec {
    fn allocate(self, port_type: PortType) -> Box<PortBuffer> {
        Box::new(PortBuffer::new(port_type, self.frames, self.midi_bytes))
    }
}

/// Clients, ports and connections of one context.
pub struct ClientGraph {
    clients: Arena<Client>,
    ports: Arena<Port>,
    /// Clients in creation order.
    order: Vec<Key>,
    client_keys: HashMap<ClientId, Key>,
    port_keys: HashMap<PortId, Key>,
    names: HashMap<String, Key>,
    /// Insertion rank of every `(output, input)` connection.
    ranks: HashMap<(Key, Key), u64>,
    next_rank: u64,
    max_client_name: usize,
    max_port_name: usize,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(':') {
        return Err(EngineError::InvalidName(name.to_owned()));
    }
    Ok(())
}

impl ClientGraph {
    /// Creates an empty graph with the given name limits.
    pub fn new(max_client_name: usize, max_port_name: usize) -> Self {
        Self {
            clients: Arena::new(),
            ports: Arena::new(),
            order: Vec::new(),
            client_keys: HashMap::new(),
            port_keys: HashMap::new(),
            names: HashMap::new(),
            ranks: HashMap::new(),
            next_rank: 0,
            max_client_name,
            max_port_name,
        }
    }

    // --- Lookup ---

    pub(crate) fn client_key(&self, id: ClientId) -> Result<Key> {
        self.client_keys
            .get(&id)
            .copied()
            .ok_or_else(|| EngineError::ClientNotFound(id.to_string()))
    }

    pub(crate) fn port_key(&self, id: PortId) -> Result<Key> {
        self.port_keys
            .get(&id)
            .copied()
            .ok_or_else(|| EngineError::PortNotFound(id.to_string()))
    }

    pub(crate) fn client(&self, key: Key) -> Result<&Client> {
        self.clients
            .get(key)
            .ok_or_else(|| EngineError::ClientNotFound(format!("{key:?}")))
    }

    fn client_mut(&mut self, key: Key) -> Result<&mut Client> {
        self.clients
            .get_mut(key)
            .ok_or_else(|| EngineError::ClientNotFound(format!("{key:?}")))
    }

    pub(crate) fn port(&self, key: Key) -> Result<&Port> {
        self.ports
            .get(key)
            .ok_or_else(|| EngineError::PortNotFound(format!("{key:?}")))
    }

    fn is_client_active(&self, key: Key) -> bool {
        self.clients.get(key).is_some_and(|c| c.active)
    }

    /// Full `client:short` name of a port.
    pub(crate) fn full_name(&self, key: Key) -> String {
        match self.ports.get(key) {
            Some(port) => {
                let client = self.clients.get(port.client).map_or("", |c| c.name.as_str());
                format!("{client}:{}", port.short_name)
            }
            None => format!("{key:?}"),
        }
    }

    /// Returns the client with this name.
    pub fn client_by_name(&self, name: &str) -> Option<ClientId> {
        let key = self.names.get(name)?;
        self.clients.get(*key).map(|c| c.id)
    }

    /// Returns the port with this `client:short` name.
    pub fn port_by_name(&self, full_name: &str) -> Option<PortId> {
        let (client, short) = full_name.split_once(':')?;
        let client = self.clients.get(*self.names.get(client)?)?;
        client.ports.iter().find_map(|&key| {
            self.ports
                .get(key)
                .filter(|p| p.short_name == short)
                .map(|p| p.id)
        })
    }

    /// Returns true if this graph holds the client.
    pub fn contains_client(&self, id: ClientId) -> bool {
        self.client_keys.contains_key(&id)
    }

    /// Returns true if this graph holds the port.
    pub fn contains_port(&self, id: PortId) -> bool {
        self.port_keys.contains_key(&id)
    }

    /// Number of clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of ports.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    // --- Queries ---

    /// Snapshot of a port.
    pub fn port_info(&self, id: PortId) -> Result<PortInfo> {
        let key = self.port_key(id)?;
        self.port_info_by_key(key)
    }

    fn port_info_by_key(&self, key: Key) -> Result<PortInfo> {
        let port = self.port(key)?;
        let client = self.client(port.client)?;
        Ok(PortInfo {
            id: port.id,
            client: client.id,
            short_name: port.short_name.clone(),
            full_name: format!("{}:{}", client.name, port.short_name),
            port_type: port.port_type,
            direction: port.direction,
            connections: port
                .connections
                .iter()
                .filter_map(|&k| self.ports.get(k).map(|p| p.id))
                .collect(),
        })
    }

    /// Snapshot of a client and its ports.
    pub fn client_info(&self, id: ClientId) -> Result<ClientInfo> {
        let key = self.client_key(id)?;
        self.client_info_by_key(key)
    }

    fn client_info_by_key(&self, key: Key) -> Result<ClientInfo> {
        let client = self.client(key)?;
        let ports = client
            .ports
            .iter()
            .map(|&p| self.port_info_by_key(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(ClientInfo {
            id: client.id,
            name: client.name.clone(),
            active: client.active,
            role: client.role,
            factory: client.factory.clone(),
            properties: client.properties.clone(),
            ports,
        })
    }

    /// Snapshots of every client in creation order.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.order
            .iter()
            .filter_map(|&k| self.client_info_by_key(k).ok())
            .collect()
    }

    /// Full names of ports matching every given filter, in client creation
    /// and port registration order.
    pub fn ports(
        &self,
        pattern: Option<&Regex>,
        port_type: Option<PortType>,
        direction: Option<PortDirection>,
    ) -> Vec<String> {
        let mut names = Vec::new();
        for &client_key in &self.order {
            let Some(client) = self.clients.get(client_key) else { continue };
            for &port_key in &client.ports {
                let Some(port) = self.ports.get(port_key) else { continue };
                if port_type.is_some_and(|t| t != port.port_type)
                    || direction.is_some_and(|d| d != port.direction)
                {
                    continue;
                }
                let full = format!("{}:{}", client.name, port.short_name);
                if pattern.is_none_or(|re| re.is_match(&full)) {
                    names.push(full);
                }
            }
        }
        names
    }

    /// Full names of the ports connected to `id`, in connection order.
    pub fn connections(&self, id: PortId) -> Result<Vec<String>> {
        let port = self.port(self.port_key(id)?)?;
        Ok(port.connections.iter().map(|&k| self.full_name(k)).collect())
    }

    /// Every connection as `(output, input)`, walking outputs in client
    /// creation and port registration order.
    pub fn connection_pairs(&self) -> Vec<(PortId, PortId)> {
        self.collect_pairs(false)
    }

    /// Connections whose two clients are both active.
    pub fn active_connection_pairs(&self) -> Vec<(PortId, PortId)> {
        self.collect_pairs(true)
    }

    fn collect_pairs(&self, active_only: bool) -> Vec<(PortId, PortId)> {
        let mut pairs = Vec::new();
        for &client_key in &self.order {
            let Some(client) = self.clients.get(client_key) else { continue };
            if active_only && !client.active {
                continue;
            }
            for &port_key in &client.ports {
                let Some(port) = self.ports.get(port_key) else { continue };
                if port.direction != PortDirection::Output {
                    continue;
                }
                for &peer in &port.connections {
                    let Some(input) = self.ports.get(peer) else { continue };
                    if active_only && !self.is_client_active(input.client) {
                        continue;
                    }
                    pairs.push((port.id, input.id));
                }
            }
        }
        pairs
    }

    /// Returns true if the two ports are connected.
    pub fn is_connected(&self, a: PortId, b: PortId) -> bool {
        let (Ok(a), Ok(b)) = (self.port_key(a), self.port_key(b)) else {
            return false;
        };
        self.ports.get(a).is_some_and(|p| p.connections.contains(&b))
    }

    // --- Event cost ---

    /// Connections of `client` whose peer client is active.
    fn live_edges(&self, client: &Client) -> usize {
        client
            .ports
            .iter()
            .filter_map(|&k| self.ports.get(k))
            .map(|p| {
                p.connections
                    .iter()
                    .filter(|&&peer| {
                        self.ports
                            .get(peer)
                            .is_some_and(|q| self.is_client_active(q.client))
                    })
                    .count()
            })
            .sum()
    }

    /// Events produced by flipping `client` to `active`.
    fn toggle_cost(&self, client: Key, active: bool) -> usize {
        match self.clients.get(client) {
            Some(c) if c.active != active => 1 + c.ports.len() + self.live_edges(c),
            _ => 0,
        }
    }

    /// Events produced by activating `client`.
    pub(crate) fn activate_cost(&self, client: Key) -> usize {
        self.toggle_cost(client, true)
    }

    /// Events produced by deactivating `client`.
    pub(crate) fn deactivate_cost(&self, client: Key) -> usize {
        self.toggle_cost(client, false)
    }

    /// Events produced by closing `client`.
    pub(crate) fn close_cost(&self, client: Key) -> usize {
        self.clients.get(client).map_or(0, |c| {
            self.deactivate_cost(client) + usize::from(c.has_handler)
        })
    }

    /// Events produced by registering a port on `client`.
    pub(crate) fn register_cost(&self, client: Key) -> usize {
        usize::from(self.is_client_active(client))
    }

    /// Events produced by unregistering `port`.
    pub(crate) fn unregister_cost(&self, port: Key) -> usize {
        match self.ports.get(port) {
            Some(p) if self.is_client_active(p.client) => {
                let live = p
                    .connections
                    .iter()
                    .filter(|&&peer| {
                        self.ports
                            .get(peer)
                            .is_some_and(|q| self.is_client_active(q.client))
                    })
                    .count();
                1 + live
            }
            _ => 0,
        }
    }

    /// Events produced by renaming `port`.
    pub(crate) fn rename_cost(&self, port: Key) -> usize {
        usize::from(self.ports.contains(port))
    }

    /// Events produced by connecting or disconnecting two ports.
    pub(crate) fn link_cost(&self, output: Key, input: Key) -> usize {
        let active = |key| {
            self.ports
                .get(key)
                .is_some_and(|p| self.is_client_active(p.client))
        };
        usize::from(active(output) && active(input))
    }

    /// Insertion rank of a connection; 0 if the pair is not connected.
    fn rank(&self, output: Key, input: Key) -> u64 {
        self.ranks.get(&(output, input)).copied().unwrap_or(0)
    }

    // --- Clients ---

    fn resolve_name(&self, name: &str, policy: NamePolicy) -> Result<String> {
        check_name(name)?;
        if name.len() > self.max_client_name {
            return Err(EngineError::NameTooLong {
                name: name.to_owned(),
                max: self.max_client_name,
            });
        }
        if !self.names.contains_key(name) {
            return Ok(name.to_owned());
        }
        if policy == NamePolicy::Exact {
            return Err(EngineError::NameInUse(name.to_owned()));
        }
        for n in 2.. {
            let candidate = format!("{name}-{n}");
            if candidate.len() > self.max_client_name {
                return Err(EngineError::NameTooLong {
                    name: candidate,
                    max: self.max_client_name,
                });
            }
            if !self.names.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(EngineError::NameInUse(name.to_owned()))
    }

    /// Adds an inactive client without ports.
    pub(crate) fn open_client(
        &mut self,
        id: ClientId,
        name: &str,
        policy: NamePolicy,
        role: ClientRole,
    ) -> Result<Key> {
        let name = self.resolve_name(name, policy)?;
        let key = self.clients.insert(Client::new(id, name.clone(), role));
        self.names.insert(name, key);
        self.client_keys.insert(id, key);
        self.order.push(key);
        Ok(key)
    }

    /// Deactivates, disconnects and removes a client with all its ports.
    ///
    /// Returns the handles of the removed ports.
    pub(crate) fn close_client(
        &mut self,
        key: Key,
        batch: &mut Vec<GraphChange>,
    ) -> Result<Vec<PortId>> {
        let client = self.client(key)?;
        let has_handler = client.has_handler;
        if client.active {
            self.deactivate(key, batch)?;
        }
        if has_handler {
            batch.push(GraphChange::ReleaseHandler { client: key });
        }
        let ports = self.client(key)?.ports.clone();
        let mut removed = Vec::with_capacity(ports.len());
        for port in ports {
            self.sever(port);
            if let Some(port) = self.ports.remove(port) {
                self.port_keys.remove(&port.id);
                removed.push(port.id);
            }
        }
        if let Some(client) = self.clients.remove(key) {
            self.names.remove(&client.name);
            self.client_keys.remove(&client.id);
        }
        self.order.retain(|&k| k != key);
        Ok(removed)
    }

    /// Drops every connection of `port` from its peers and from itself.
    fn sever(&mut self, port: Key) {
        let peers = match self.ports.get_mut(port) {
            Some(p) => std::mem::take(&mut p.connections),
            None => return,
        };
        for peer in peers {
            if let Some(p) = self.ports.get_mut(peer) {
                p.connections.retain(|&k| k != port);
            }
            self.ranks.remove(&(port, peer));
            self.ranks.remove(&(peer, port));
        }
    }

    /// Pushes `Connect` (or `Disconnect`) events for every connection of
    /// `client` whose peer is active.
    fn push_edges(&self, client: Key, connect: bool, batch: &mut Vec<GraphChange>) {
        let Some(c) = self.clients.get(client) else { return };
        for &port_key in &c.ports {
            let Some(port) = self.ports.get(port_key) else { continue };
            for &peer in &port.connections {
                let Some(q) = self.ports.get(peer) else { continue };
                if !self.is_client_active(q.client) {
                    continue;
                }
                let (output, input) = match port.direction {
                    PortDirection::Output => (port_key, peer),
                    PortDirection::Input => (peer, port_key),
                };
                batch.push(if connect {
                    GraphChange::Connect {
                        output,
                        input,
                        rank: self.rank(output, input),
                    }
                } else {
                    GraphChange::Disconnect { output, input }
                });
            }
        }
    }

    /// Makes a client visible to the real-time thread with its ports and the
    /// connections to other active clients.
    pub(crate) fn activate(
        &mut self,
        key: Key,
        spec: BufferSpec,
        batch: &mut Vec<GraphChange>,
    ) -> Result<()> {
        let client = self.client(key)?;
        if client.active {
            return Ok(());
        }
        batch.push(GraphChange::Activate {
            client: key,
            id: client.id,
            preserve_outputs: client.role == ClientRole::Inlet,
        });
        for &port_key in &client.ports {
            let port = self.port(port_key)?;
            batch.push(GraphChange::RegisterPort {
                port: port_key,
                client: key,
                id: port.id,
                direction: port.direction,
                buffer: spec.allocate(port.port_type),
            });
        }
        self.push_edges(key, true, batch);
        self.client_mut(key)?.active = true;
        Ok(())
    }

    /// Removes a client's twin, its port twins and their live connections.
    pub(crate) fn deactivate(&mut self, key: Key, batch: &mut Vec<GraphChange>) -> Result<()> {
        let client = self.client(key)?;
        if !client.active {
            return Ok(());
        }
        self.push_edges(key, false, batch);
        for &port in &client.ports {
            batch.push(GraphChange::UnregisterPort { port });
        }
        batch.push(GraphChange::Deactivate { client: key });
        self.client_mut(key)?.active = false;
        Ok(())
    }

    /// Installs the process handler of an inactive client.
    pub(crate) fn set_handler(
        &mut self,
        key: Key,
        handler: Box<dyn ProcessHandler>,
        batch: &mut Vec<GraphChange>,
    ) -> Result<()> {
        let client = self.client_mut(key)?;
        if client.active {
            return Err(EngineError::ClientActive(client.name.clone()));
        }
        client.has_handler = true;
        batch.push(GraphChange::InstallHandler {
            client: key,
            handler,
        });
        Ok(())
    }

    pub(crate) fn set_properties(&mut self, key: Key, properties: Vec<u8>) -> Result<()> {
        self.client_mut(key)?.properties = properties;
        Ok(())
    }

    pub(crate) fn set_factory(&mut self, key: Key, factory: Option<String>) -> Result<()> {
        self.client_mut(key)?.factory = factory;
        Ok(())
    }

    // --- Ports ---

    fn check_port_name(&self, client: &Client, short: &str, except: Option<Key>) -> Result<()> {
        check_name(short)?;
        let full_len = client.name.len() + 1 + short.len();
        if full_len > self.max_port_name {
            return Err(EngineError::NameTooLong {
                name: format!("{}:{short}", client.name),
                max: self.max_port_name,
            });
        }
        let taken = client.ports.iter().any(|&k| {
            Some(k) != except && self.ports.get(k).is_some_and(|p| p.short_name == short)
        });
        if taken {
            return Err(EngineError::NameInUse(format!("{}:{short}", client.name)));
        }
        Ok(())
    }

    /// Fails the way [`register_port`](Self::register_port) would for `short`
    /// on `client`, without changing anything.
    pub(crate) fn check_new_port(&self, client: Key, short: &str) -> Result<()> {
        self.check_port_name(self.client(client)?, short, None)
    }

    /// Adds a port to a client. Active clients get the port twin immediately.
    pub(crate) fn register_port(
        &mut self,
        id: PortId,
        client_key: Key,
        short: &str,
        port_type: PortType,
        direction: PortDirection,
        spec: BufferSpec,
        batch: &mut Vec<GraphChange>,
    ) -> Result<Key> {
        let client = self.client(client_key)?;
        self.check_port_name(client, short, None)?;
        let active = client.active;

        let key = self.ports.insert(Port {
            id,
            client: client_key,
            short_name: short.to_owned(),
            port_type,
            direction,
            connections: Vec::new(),
        });
        self.port_keys.insert(id, key);
        self.client_mut(client_key)?.ports.push(key);
        if active {
            batch.push(GraphChange::RegisterPort {
                port: key,
                client: client_key,
                id,
                direction,
                buffer: spec.allocate(port_type),
            });
        }
        Ok(key)
    }

    /// Disconnects and removes a port.
    pub(crate) fn unregister_port(&mut self, key: Key, batch: &mut Vec<GraphChange>) -> Result<()> {
        let port = self.port(key)?;
        let client_key = port.client;
        if self.is_client_active(client_key) {
            for &peer in &port.connections {
                let Some(q) = self.ports.get(peer) else { continue };
                if !self.is_client_active(q.client) {
                    continue;
                }
                let (output, input) = match port.direction {
                    PortDirection::Output => (key, peer),
                    PortDirection::Input => (peer, key),
                };
                batch.push(GraphChange::Disconnect { output, input });
            }
            batch.push(GraphChange::UnregisterPort { port: key });
        }
        self.sever(key);
        if let Some(port) = self.ports.remove(key) {
            self.port_keys.remove(&port.id);
        }
        self.client_mut(client_key)?.ports.retain(|&k| k != key);
        Ok(())
    }

    /// Changes a port's short name.
    pub(crate) fn rename_port(
        &mut self,
        key: Key,
        short: &str,
        batch: &mut Vec<GraphChange>,
    ) -> Result<()> {
        let client = self.client(self.port(key)?.client)?;
        self.check_port_name(client, short, Some(key))?;
        if let Some(port) = self.ports.get_mut(key) {
            port.short_name = short.to_owned();
        }
        batch.push(GraphChange::Rename { port: key });
        Ok(())
    }

    // --- Connections ---

    /// DFS reachability over the induced client graph.
    fn can_reach(&self, from: Key, to: Key) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            let Some(client) = self.clients.get(current) else { continue };
            for &port_key in &client.ports {
                let Some(port) = self.ports.get(port_key) else { continue };
                if port.direction != PortDirection::Output {
                    continue;
                }
                for &peer in &port.connections {
                    if let Some(input) = self.ports.get(peer) {
                        stack.push(input.client);
                    }
                }
            }
        }
        false
    }

    fn check_endpoints(&self, output: Key, input: Key) -> Result<(&Port, &Port)> {
        let out = self.port(output)?;
        let inp = self.port(input)?;
        if out.direction != PortDirection::Output {
            return Err(EngineError::DirectionMismatch {
                port: self.full_name(output),
                expected: PortDirection::Output,
            });
        }
        if inp.direction != PortDirection::Input {
            return Err(EngineError::DirectionMismatch {
                port: self.full_name(input),
                expected: PortDirection::Input,
            });
        }
        Ok((out, inp))
    }

    /// Fails the way [`connect`](Self::connect) would, without changing
    /// anything.
    pub(crate) fn check_connect(&self, output: Key, input: Key) -> Result<()> {
        let (out, inp) = self.check_endpoints(output, input)?;
        if out.port_type != inp.port_type {
            return Err(EngineError::TypeMismatch {
                output: out.port_type,
                input: inp.port_type,
            });
        }
        if out.connections.contains(&input) {
            return Err(EngineError::AlreadyConnected(
                self.full_name(output),
                self.full_name(input),
            ));
        }
        if self.can_reach(inp.client, out.client) {
            return Err(EngineError::CycleDetected(
                self.full_name(output),
                self.full_name(input),
            ));
        }
        Ok(())
    }

    /// Connects an output to an input.
    pub(crate) fn connect(
        &mut self,
        output: Key,
        input: Key,
        batch: &mut Vec<GraphChange>,
    ) -> Result<()> {
        self.check_connect(output, input)?;
        let live = self.link_cost(output, input) == 1;

        if let Some(p) = self.ports.get_mut(output) {
            p.connections.push(input);
        }
        if let Some(p) = self.ports.get_mut(input) {
            p.connections.push(output);
        }
        let rank = self.next_rank;
        self.next_rank += 1;
        self.ranks.insert((output, input), rank);
        if live {
            batch.push(GraphChange::Connect {
                output,
                input,
                rank,
            });
        }
        Ok(())
    }

    /// Disconnects an output from an input.
    pub(crate) fn disconnect(
        &mut self,
        output: Key,
        input: Key,
        batch: &mut Vec<GraphChange>,
    ) -> Result<()> {
        let (out, inp) = self.check_endpoints(output, input)?;
        if !out.connections.contains(&input) {
            return Err(EngineError::NotConnected(
                self.full_name(output),
                self.full_name(input),
            ));
        }
        let live = self.is_client_active(out.client) && self.is_client_active(inp.client);

        if let Some(p) = self.ports.get_mut(output) {
            p.connections.retain(|&k| k != input);
        }
        if let Some(p) = self.ports.get_mut(input) {
            p.connections.retain(|&k| k != output);
        }
        self.ranks.remove(&(output, input));
        if live {
            batch.push(GraphChange::Disconnect { output, input });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: BufferSpec = BufferSpec {
        frames: 16,
        midi_bytes: 256,
    };

    struct Fixture {
        graph: ClientGraph,
        next: u64,
        batch: Vec<GraphChange>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                graph: ClientGraph::new(16, 32),
                next: 1,
                batch: Vec::new(),
            }
        }

        fn id(&mut self) -> u64 {
            self.next += 1;
            self.next
        }

        fn client(&mut self, name: &str) -> Key {
            let id = ClientId(self.id());
            self.graph
                .open_client(id, name, NamePolicy::Exact, ClientRole::Plain)
                .unwrap()
        }

        fn port(&mut self, client: Key, short: &str, t: PortType, d: PortDirection) -> Key {
            let id = PortId(self.id());
            self.graph
                .register_port(id, client, short, t, d, LAYOUT, &mut self.batch)
                .unwrap()
        }
    }

    fn audio_pair(f: &mut Fixture) -> (Key, Key, Key, Key) {
        let a = f.client("a");
        let b = f.client("b");
        let out = f.port(a, "out", PortType::Audio, PortDirection::Output);
        let inp = f.port(b, "in", PortType::Audio, PortDirection::Input);
        (a, b, out, inp)
    }

    // --- Naming ---

    #[test]
    fn test_open_rejects_duplicate_and_long_names() {
        let mut f = Fixture::new();
        f.client("synth");
        let result = f
            .graph
            .open_client(ClientId(99), "synth", NamePolicy::Exact, ClientRole::Plain);
        assert!(matches!(result, Err(EngineError::NameInUse(_))));

        let result = f.graph.open_client(
            ClientId(100),
            "a-name-that-is-way-too-long",
            NamePolicy::Exact,
            ClientRole::Plain,
        );
        assert!(matches!(result, Err(EngineError::NameTooLong { max: 16, .. })));
        assert_eq!(f.graph.client_count(), 1);
    }

    #[test]
    fn test_unique_policy_appends_suffix() {
        let mut f = Fixture::new();
        f.client("osc");
        f.graph
            .open_client(ClientId(50), "osc", NamePolicy::Unique, ClientRole::Plain)
            .unwrap();
        f.graph
            .open_client(ClientId(51), "osc", NamePolicy::Unique, ClientRole::Plain)
            .unwrap();
        assert_eq!(f.graph.client_by_name("osc-2"), Some(ClientId(50)));
        assert_eq!(f.graph.client_by_name("osc-3"), Some(ClientId(51)));
    }

    #[test]
    fn test_names_reject_colon_and_empty() {
        let mut f = Fixture::new();
        let r = f
            .graph
            .open_client(ClientId(7), "a:b", NamePolicy::Exact, ClientRole::Plain);
        assert!(matches!(r, Err(EngineError::InvalidName(_))));
        let c = f.client("c");
        let r = f.graph.register_port(
            PortId(8),
            c,
            "",
            PortType::Audio,
            PortDirection::Input,
            LAYOUT,
            &mut f.batch,
        );
        assert!(matches!(r, Err(EngineError::InvalidName(_))));
    }

    #[test]
    fn test_port_full_name_limit_and_collision() {
        let mut f = Fixture::new();
        let c = f.client("client");
        f.port(c, "in", PortType::Audio, PortDirection::Input);
        let r = f.graph.register_port(
            PortId(90),
            c,
            "in",
            PortType::Midi,
            PortDirection::Input,
            LAYOUT,
            &mut f.batch,
        );
        assert!(matches!(r, Err(EngineError::NameInUse(_))));
        // "client:" is 7 bytes, the limit is 32
        let long = "x".repeat(26);
        let r = f.graph.register_port(
            PortId(91),
            c,
            &long,
            PortType::Audio,
            PortDirection::Input,
            LAYOUT,
            &mut f.batch,
        );
        assert!(matches!(r, Err(EngineError::NameTooLong { max: 32, .. })));
        assert_eq!(f.graph.port_count(), 1);
    }

    #[test]
    fn test_port_lookup_by_full_name() {
        let mut f = Fixture::new();
        let (_, _, out, _) = audio_pair(&mut f);
        let id = f.graph.port(out).unwrap().id;
        assert_eq!(f.graph.port_by_name("a:out"), Some(id));
        assert_eq!(f.graph.port_by_name("a:missing"), None);
        assert_eq!(f.graph.port_by_name("nope"), None);
    }

    // --- Connections ---

    #[test]
    fn test_connect_and_disconnect() {
        let mut f = Fixture::new();
        let (_, _, out, inp) = audio_pair(&mut f);
        f.graph.connect(out, inp, &mut f.batch).unwrap();
        let (o, i) = (f.graph.port(out).unwrap().id, f.graph.port(inp).unwrap().id);
        assert!(f.graph.is_connected(o, i));
        assert_eq!(f.graph.connection_pairs(), vec![(o, i)]);
        assert_eq!(f.graph.connections(i).unwrap(), vec!["a:out".to_owned()]);

        f.graph.disconnect(out, inp, &mut f.batch).unwrap();
        assert!(!f.graph.is_connected(o, i));
        // neither client is active, so nothing reached the batch
        assert!(f.batch.is_empty());
    }

    #[test]
    fn test_connect_rejections() {
        let mut f = Fixture::new();
        let (a, b, out, inp) = audio_pair(&mut f);
        let midi_in = f.port(b, "midi", PortType::Midi, PortDirection::Input);
        let other_in = f.port(a, "in", PortType::Audio, PortDirection::Input);

        let r = f.graph.connect(inp, out, &mut f.batch);
        assert!(matches!(
            r,
            Err(EngineError::DirectionMismatch {
                expected: PortDirection::Output,
                ..
            })
        ));
        let r = f.graph.connect(out, midi_in, &mut f.batch);
        assert!(matches!(r, Err(EngineError::TypeMismatch { .. })));
        let r = f.graph.connect(out, other_in, &mut f.batch);
        assert!(matches!(r, Err(EngineError::CycleDetected(..))));

        f.graph.connect(out, inp, &mut f.batch).unwrap();
        let r = f.graph.connect(out, inp, &mut f.batch);
        assert!(matches!(r, Err(EngineError::AlreadyConnected(..))));
        let r = f.graph.disconnect(out, other_in, &mut f.batch);
        assert!(matches!(r, Err(EngineError::NotConnected(..))));
    }

    #[test]
    fn test_cycle_through_three_clients_rejected() {
        let mut f = Fixture::new();
        let a = f.client("a");
        let b = f.client("b");
        let c = f.client("c");
        let a_out = f.port(a, "out", PortType::Audio, PortDirection::Output);
        let a_in = f.port(a, "in", PortType::Audio, PortDirection::Input);
        let b_out = f.port(b, "out", PortType::Audio, PortDirection::Output);
        let b_in = f.port(b, "in", PortType::Audio, PortDirection::Input);
        let c_out = f.port(c, "out", PortType::Audio, PortDirection::Output);
        let c_in = f.port(c, "in", PortType::Audio, PortDirection::Input);

        f.graph.connect(a_out, b_in, &mut f.batch).unwrap();
        f.graph.connect(b_out, c_in, &mut f.batch).unwrap();
        let r = f.graph.connect(c_out, a_in, &mut f.batch);
        assert!(matches!(r, Err(EngineError::CycleDetected(..))));
        // a diamond is fine
        f.graph.connect(a_out, c_in, &mut f.batch).unwrap();
    }

    // --- Activation ---

    #[test]
    fn test_activation_emits_ports_and_live_edges() {
        let mut f = Fixture::new();
        let (a, b, out, inp) = audio_pair(&mut f);
        f.graph.connect(out, inp, &mut f.batch).unwrap();

        assert_eq!(f.graph.activate_cost(a), 2);
        f.graph.activate(a, LAYOUT, &mut f.batch).unwrap();
        // peer inactive: Activate + RegisterPort only
        assert_eq!(f.batch.len(), 2);
        f.batch.clear();

        assert_eq!(f.graph.activate_cost(b), 3);
        f.graph.activate(b, LAYOUT, &mut f.batch).unwrap();
        assert_eq!(f.batch.len(), 3);
        assert!(matches!(f.batch[2], GraphChange::Connect { output, input, .. } if output == out && input == inp));
        f.batch.clear();

        f.graph.deactivate(a, &mut f.batch).unwrap();
        assert!(matches!(f.batch[0], GraphChange::Disconnect { .. }));
        assert!(matches!(f.batch[1], GraphChange::UnregisterPort { port } if port == out));
        assert!(matches!(f.batch[2], GraphChange::Deactivate { client } if client == a));

        // the control-plane connection survives deactivation
        let (o, i) = (f.graph.port(out).unwrap().id, f.graph.port(inp).unwrap().id);
        assert!(f.graph.is_connected(o, i));
        assert!(f.graph.active_connection_pairs().is_empty());
    }

    #[test]
    fn test_costs_match_emitted_events() {
        let mut f = Fixture::new();
        let (a, b, out, inp) = audio_pair(&mut f);

        // nothing is active: no call reaches the channel
        assert_eq!(f.graph.register_cost(a), 0);
        assert_eq!(f.graph.link_cost(out, inp), 0);
        assert_eq!(f.graph.unregister_cost(out), 0);
        assert_eq!(f.graph.deactivate_cost(a), 0);
        f.graph.connect(out, inp, &mut f.batch).unwrap();
        assert!(f.batch.is_empty());

        f.graph.activate(a, LAYOUT, &mut f.batch).unwrap();
        f.graph.activate(b, LAYOUT, &mut f.batch).unwrap();
        assert_eq!(f.graph.activate_cost(a), 0);
        f.batch.clear();

        let cost = f.graph.link_cost(out, inp);
        f.graph.disconnect(out, inp, &mut f.batch).unwrap();
        assert_eq!((cost, f.batch.len()), (1, 1));
        f.batch.clear();

        let cost = f.graph.register_cost(b);
        let extra = f.port(b, "extra", PortType::Audio, PortDirection::Input);
        assert_eq!((cost, f.batch.len()), (1, 1));
        f.batch.clear();

        f.graph.connect(out, extra, &mut f.batch).unwrap();
        f.batch.clear();
        let cost = f.graph.unregister_cost(extra);
        f.graph.unregister_port(extra, &mut f.batch).unwrap();
        assert_eq!((cost, f.batch.len()), (2, 2));
        f.batch.clear();

        let cost = f.graph.rename_cost(inp);
        f.graph.rename_port(inp, "input", &mut f.batch).unwrap();
        assert_eq!((cost, f.batch.len()), (1, 1));
    }

    #[test]
    fn test_reactivation_keeps_connection_ranks() {
        let mut f = Fixture::new();
        let a = f.client("a");
        let b = f.client("b");
        let sink = f.client("sink");
        let a_out = f.port(a, "out", PortType::Midi, PortDirection::Output);
        let b_out = f.port(b, "out", PortType::Midi, PortDirection::Output);
        let inp = f.port(sink, "in", PortType::Midi, PortDirection::Input);
        f.graph.connect(a_out, inp, &mut f.batch).unwrap();
        f.graph.connect(b_out, inp, &mut f.batch).unwrap();
        for c in [a, b, sink] {
            f.graph.activate(c, LAYOUT, &mut f.batch).unwrap();
        }
        f.graph.deactivate(a, &mut f.batch).unwrap();
        f.batch.clear();

        f.graph.activate(a, LAYOUT, &mut f.batch).unwrap();
        let rank = f.batch.iter().find_map(|c| match c {
            GraphChange::Connect { rank, .. } => Some(*rank),
            _ => None,
        });
        // a connected first, so it still ranks ahead of b
        assert_eq!(rank, Some(0));
        assert_eq!(f.graph.rank(b_out, inp), 1);
    }

    #[test]
    fn test_handler_requires_inactive_client() {
        let mut f = Fixture::new();
        let a = f.client("a");
        f.graph.activate(a, LAYOUT, &mut f.batch).unwrap();
        fn noop(_: &mut crate::process::ProcessScope<'_>) -> std::result::Result<(), crate::error::ProcessError> {
            Ok(())
        }
        let r = f.graph.set_handler(a, Box::new(noop), &mut f.batch);
        assert!(matches!(r, Err(EngineError::ClientActive(_))));
    }

    // --- Teardown ---

    #[test]
    fn test_close_severs_peers() {
        let mut f = Fixture::new();
        let (a, b, out, inp) = audio_pair(&mut f);
        f.graph.connect(out, inp, &mut f.batch).unwrap();
        f.graph.activate(a, LAYOUT, &mut f.batch).unwrap();
        f.graph.activate(b, LAYOUT, &mut f.batch).unwrap();
        f.batch.clear();

        let cost = f.graph.close_cost(a);
        let removed = f.graph.close_client(a, &mut f.batch).unwrap();
        assert_eq!(f.batch.len(), cost);
        assert_eq!(removed.len(), 1);
        assert!(f.graph.port(inp).unwrap().connections.is_empty());
        assert_eq!(f.graph.client_by_name("a"), None);
        assert_eq!(f.graph.clients().len(), 1);
    }

    #[test]
    fn test_unregister_and_rename() {
        let mut f = Fixture::new();
        let (_, b, out, inp) = audio_pair(&mut f);
        f.graph.connect(out, inp, &mut f.batch).unwrap();
        f.graph.rename_port(inp, "input", &mut f.batch).unwrap();
        assert_eq!(f.graph.full_name(inp), "b:input");

        f.port(b, "other", PortType::Audio, PortDirection::Input);
        let r = f.graph.rename_port(inp, "other", &mut f.batch);
        assert!(matches!(r, Err(EngineError::NameInUse(_))));

        f.graph.unregister_port(inp, &mut f.batch).unwrap();
        assert!(f.graph.port(out).unwrap().connections.is_empty());
        assert_eq!(
            f.graph.ports(None, None, None),
            vec!["a:out".to_owned(), "b:other".to_owned()]
        );
    }

    #[test]
    fn test_port_query_filters() {
        let mut f = Fixture::new();
        let (_, b, _, _) = audio_pair(&mut f);
        f.port(b, "midi_in", PortType::Midi, PortDirection::Input);
        let re = Regex::new("^b:").unwrap();
        assert_eq!(
            f.graph.ports(Some(&re), None, None),
            vec!["b:in".to_owned(), "b:midi_in".to_owned()]
        );
        assert_eq!(
            f.graph.ports(None, Some(PortType::Midi), None),
            vec!["b:midi_in".to_owned()]
        );
        assert_eq!(
            f.graph.ports(None, None, Some(PortDirection::Output)),
            vec!["a:out".to_owned()]
        );
    }
}
