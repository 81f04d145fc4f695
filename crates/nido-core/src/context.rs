//! One routing context: a client graph plus the control end of its channel.
//!
//! The real-time half of a context (twin mirror and scheduler) lives in an
//! [`RtEngine`](crate::RtEngine): the host owns the root engine, and each
//! nested engine is owned by the macro client that stands for it in the
//! parent. A [`Context`] only ever talks to that half through its change
//! channel.

use crate::arena::Key;
use crate::bridge::{BridgeLink, InterfaceBridge};
use crate::channel::{ChangeSender, GraphChange, Reclaimed, Rendezvous};
use crate::error::{EngineError, Result};
use crate::graph::{BufferSpec, ClientGraph, ClientId, ClientRole, NamePolicy, PortDirection, PortId, PortType};
use crate::process::ProcessHandler;
use crate::router::ContextId;
use std::collections::HashMap;
use std::sync::Arc;

/// What a context is bound to.
pub(crate) enum Backend {
    /// Driven directly by the host.
    Root,
    /// Driven by a macro client in the parent context.
    Nested(InterfaceBridge),
}

pub(crate) struct Context {
    pub(crate) name: String,
    pub(crate) graph: ClientGraph,
    sender: ChangeSender,
    pub(crate) backend: Backend,
    pub(crate) spec: BufferSpec,
    pub(crate) sample_rate: f32,
    pub(crate) children: Vec<ContextId>,
}

impl Context {
    pub(crate) fn new(
        name: String,
        graph: ClientGraph,
        sender: ChangeSender,
        backend: Backend,
        spec: BufferSpec,
        sample_rate: f32,
    ) -> Self {
        Self {
            name,
            graph,
            sender,
            backend,
            spec,
            sample_rate,
            children: Vec::new(),
        }
    }

    pub(crate) fn rendezvous(&self) -> &Arc<Rendezvous> {
        self.sender.rendezvous()
    }

    pub(crate) fn bridge(&self) -> Option<&InterfaceBridge> {
        match &self.backend {
            Backend::Root => None,
            Backend::Nested(bridge) => Some(bridge),
        }
    }

    pub(crate) fn bridge_mut(&mut self) -> Option<&mut InterfaceBridge> {
        match &mut self.backend {
            Backend::Root => None,
            Backend::Nested(bridge) => Some(bridge),
        }
    }

    /// Events submitted but not yet applied by the real-time thread.
    pub(crate) fn pending_events(&self) -> usize {
        self.sender.pending()
    }

    /// Events still held back for lack of room on the channel.
    pub(crate) fn backlogged_events(&self) -> usize {
        self.sender.backlogged()
    }

    /// Hands backlogged events to the real-time thread.
    pub(crate) fn flush(&mut self) {
        self.sender.flush();
    }

    /// Runs a graph mutation and submits its events as one batch.
    ///
    /// `cost` is the exact number of events `op` produces on success.
    fn commit<T>(
        &mut self,
        cost: usize,
        op: impl FnOnce(&mut ClientGraph, &mut Vec<GraphChange>) -> Result<T>,
    ) -> Result<T> {
        let mut batch = Vec::with_capacity(cost);
        let out = op(&mut self.graph, &mut batch)?;
        debug_assert_eq!(batch.len(), cost, "event cost out of step with the graph");
        self.sender.submit(batch);
        Ok(out)
    }

    pub(crate) fn open_client(
        &mut self,
        id: ClientId,
        name: &str,
        policy: NamePolicy,
        role: ClientRole,
    ) -> Result<Key> {
        self.graph.open_client(id, name, policy, role)
    }

    pub(crate) fn close_client(&mut self, key: Key) -> Result<Vec<PortId>> {
        let cost = self.graph.close_cost(key);
        self.commit(cost, |graph, batch| graph.close_client(key, batch))
    }

    pub(crate) fn activate(&mut self, key: Key) -> Result<()> {
        let cost = self.graph.activate_cost(key);
        let spec = self.spec;
        self.commit(cost, |graph, batch| graph.activate(key, spec, batch))
    }

    pub(crate) fn deactivate(&mut self, key: Key) -> Result<()> {
        let cost = self.graph.deactivate_cost(key);
        self.commit(cost, |graph, batch| graph.deactivate(key, batch))
    }

    /// Installs a handler and activates the client in one batch.
    pub(crate) fn install_and_activate(
        &mut self,
        key: Key,
        handler: Box<dyn ProcessHandler>,
    ) -> Result<()> {
        let cost = 1 + self.graph.activate_cost(key);
        let spec = self.spec;
        self.commit(cost, |graph, batch| {
            graph.set_handler(key, handler, batch)?;
            graph.activate(key, spec, batch)
        })
    }

    pub(crate) fn set_handler(&mut self, key: Key, handler: Box<dyn ProcessHandler>) -> Result<()> {
        self.commit(1, |graph, batch| graph.set_handler(key, handler, batch))
    }

    pub(crate) fn register_port(
        &mut self,
        id: PortId,
        client: Key,
        short: &str,
        port_type: PortType,
        direction: PortDirection,
    ) -> Result<Key> {
        let spec = self.spec;
        let cost = self.graph.register_cost(client);
        self.commit(cost, |graph, batch| {
            graph.register_port(id, client, short, port_type, direction, spec, batch)
        })
    }

    pub(crate) fn unregister_port(&mut self, key: Key) -> Result<()> {
        let cost = self.graph.unregister_cost(key);
        self.commit(cost, |graph, batch| graph.unregister_port(key, batch))
    }

    pub(crate) fn rename_port(&mut self, key: Key, short: &str) -> Result<()> {
        let cost = self.graph.rename_cost(key);
        self.commit(cost, |graph, batch| graph.rename_port(key, short, batch))
    }

    pub(crate) fn connect(&mut self, output: Key, input: Key) -> Result<()> {
        let cost = self.graph.link_cost(output, input);
        self.commit(cost, |graph, batch| graph.connect(output, input, batch))
    }

    pub(crate) fn disconnect(&mut self, output: Key, input: Key) -> Result<()> {
        let cost = self.graph.link_cost(output, input);
        self.commit(cost, |graph, batch| graph.disconnect(output, input, batch))
    }

    /// Hands a bridge link to this context's engine.
    pub(crate) fn link(&mut self, link: BridgeLink) {
        self.sender.submit(vec![GraphChange::BridgeLink(Box::new(link))]);
    }

    /// Frees everything the real-time thread handed back.
    ///
    /// Returned buffers clear their entry in `pending_free`.
    pub(crate) fn reclaim(&mut self, pending_free: &mut HashMap<PortId, ContextId>) {
        for item in self.sender.take_reclaimed() {
            match item {
                Reclaimed::Buffer(port, buffer) => {
                    pending_free.remove(&port);
                    drop(buffer);
                }
                Reclaimed::Handler(handler) => drop(handler),
            }
        }
    }

    /// Resolves a port handle that must belong to this context.
    pub(crate) fn port_key(&self, port: PortId) -> Result<Key> {
        self.graph.port_key(port)
    }

    pub(crate) fn client_key(&self, client: ClientId) -> Result<Key> {
        self.graph.client_key(client)
    }

    pub(crate) fn role_of(&self, client: ClientId) -> Result<ClientRole> {
        Ok(self.graph.client(self.client_key(client)?)?.role)
    }

    pub(crate) fn is_active(&self, client: ClientId) -> Result<bool> {
        Ok(self.graph.client(self.client_key(client)?)?.active)
    }

    pub(crate) fn client_name(&self, client: ClientId) -> Result<&str> {
        Ok(self.graph.client(self.client_key(client)?)?.name.as_str())
    }

    /// Ports of `client`, in registration order.
    pub(crate) fn client_ports(&self, client: ClientId) -> Result<Vec<PortId>> {
        let c = self.graph.client(self.client_key(client)?)?;
        c.ports
            .iter()
            .map(|&k| self.graph.port(k).map(|p| p.id))
            .collect()
    }

    pub(crate) fn owner_of(&self, port: PortId) -> Result<ClientId> {
        let p = self.graph.port(self.port_key(port)?)?;
        Ok(self.graph.client(p.client)?.id)
    }

    pub(crate) fn require_nested(&self, id: ContextId) -> Result<&InterfaceBridge> {
        self.bridge().ok_or(EngineError::NotNested(id))
    }
}
