//! The meta context: a stack of nested routing contexts behind one API.
//!
//! A [`ContextRouter`] owns every [`Context`] of an engine instance. The root
//! context is created with the router; [`push`](ContextRouter::push) creates a
//! nested context that appears in the current one as a macro client, and
//! every unqualified call (`open_client`, `ports`, `connect_by_name`, ...)
//! addresses the context on top of the stack. Handle-based calls find their
//! context through the handle, so a [`PortId`] or [`ClientId`] stays valid
//! whatever is on top.
//!
//! Every mutating call first frees whatever the real-time threads have handed
//! back since the last call and hands over changes still held in a context's
//! backlog.
//!
//! # Example
//!
//! ```
//! use nido_core::{ContextRouter, EngineConfig, PortDirection, PortType};
//!
//! let (mut router, mut engine) = ContextRouter::new(EngineConfig::default());
//! let synth = router.open_client("synth", Default::default()).unwrap();
//! let out = router
//!     .register_port(synth, "out", PortType::Audio, PortDirection::Output)
//!     .unwrap();
//!
//! let fx = router.push("fx", 2).unwrap();
//! assert_eq!(router.current(), fx);
//! router.connect_by_name("inlet:audio_1", "outlet:audio_1").unwrap();
//! router.pop().unwrap();
//!
//! router.activate(synth).unwrap();
//! router.connect_by_name("synth:out", "fx:inlet_audio_1").unwrap();
//! assert_eq!(router.connections(out).unwrap(), vec!["fx:inlet_audio_1"]);
//! engine.process(256).unwrap();
//! ```

use crate::arena::Key;
use crate::bridge::{
    BridgeLink, BridgePort, BridgeSide, InterfaceBridge, LinkRecord, MacroHandler,
    derived_port_name, free_port_name,
};
use crate::channel::{Rendezvous, channel};
use crate::config::{EngineConfig, MAX_CONTEXT_FRAMES, MAX_OVERSAMPLING};
use crate::context::{Backend, Context};
use crate::engine::RtEngine;
use crate::error::{EngineError, Result};
use crate::graph::{
    BufferSpec, ClientGraph, ClientId, ClientInfo, ClientRole, NamePolicy, PortDirection, PortId,
    PortInfo, PortType,
};
use crate::process::ProcessHandler;
use crate::resample::Resampler;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Router-wide unique context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u32);

impl ContextId {
    /// Returns the raw handle value.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A bridge port about to be linked, with every name checked.
struct LinkPlan {
    /// Nested context owning the bridge client.
    ctx: ContextId,
    parent: ContextId,
    /// Child-side port being linked.
    port: PortId,
    bridge_client: ClientId,
    macro_client: ClientId,
    side: BridgeSide,
    port_type: PortType,
    direction: PortDirection,
    factor: usize,
    /// Name of the new macro-client port.
    upper_name: String,
    /// Name of the free port replacing the linked one.
    free_name: String,
}

/// Ports registered for a plan, ready to be linked.
struct LinkPorts {
    upper: PortId,
    lower_key: Key,
    upper_key: Key,
}

/// Control-plane owner of every routing context.
pub struct ContextRouter {
    config: EngineConfig,
    contexts: HashMap<ContextId, Context>,
    root: ContextId,
    /// Contexts selected by `push`, root first.
    stack: Vec<ContextId>,
    client_owner: HashMap<ClientId, ContextId>,
    port_owner: HashMap<PortId, ContextId>,
    /// Ports whose buffer is still held by a real-time thread.
    pending_free: HashMap<PortId, ContextId>,
    next_context: u32,
    next_client: u64,
    next_port: u64,
}

impl ContextRouter {
    /// Creates a router with an empty root context.
    ///
    /// The returned engine is the root context's process callback; hand it to
    /// the host (or a [`HostThread`](crate::HostThread)).
    pub fn new(config: EngineConfig) -> (Self, RtEngine) {
        let (sender, receiver) = channel(config.channel_capacity, config.reclaim_capacity, None);
        let spec = BufferSpec {
            frames: config.frames,
            midi_bytes: config.midi_buffer_bytes,
        };
        let engine = RtEngine::new(receiver, spec.frames, spec.midi_bytes);
        let root = ContextId(0);
        let context = Context::new(
            "root".to_owned(),
            ClientGraph::new(config.max_client_name, config.max_port_name),
            sender,
            Backend::Root,
            spec,
            config.sample_rate,
        );
        let router = Self {
            contexts: HashMap::from([(root, context)]),
            root,
            stack: vec![root],
            client_owner: HashMap::new(),
            port_owner: HashMap::new(),
            pending_free: HashMap::new(),
            next_context: 1,
            next_client: 1,
            next_port: 1,
            config,
        };
        (router, engine)
    }

    /// Engine-wide configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Lookup helpers ---

    fn ctx(&self, id: ContextId) -> Result<&Context> {
        self.contexts.get(&id).ok_or(EngineError::ContextNotFound(id))
    }

    fn ctx_mut(&mut self, id: ContextId) -> Result<&mut Context> {
        self.contexts.get_mut(&id).ok_or(EngineError::ContextNotFound(id))
    }

    fn client_ctx(&self, client: ClientId) -> Result<ContextId> {
        self.client_owner
            .get(&client)
            .copied()
            .ok_or_else(|| EngineError::ClientNotFound(client.to_string()))
    }

    fn port_ctx(&self, port: PortId) -> Result<ContextId> {
        self.port_owner
            .get(&port)
            .copied()
            .ok_or_else(|| EngineError::PortNotFound(port.to_string()))
    }

    /// Frees buffers and handlers handed back by every real-time thread and
    /// moves backlogged changes onto their channels.
    ///
    /// Mutating calls do this on entry; call it directly to free memory
    /// without changing the topology.
    pub fn reclaim(&mut self) {
        for context in self.contexts.values_mut() {
            if context.backlogged_events() > 0 {
                context.flush();
            }
            context.reclaim(&mut self.pending_free);
        }
    }

    /// Hands every backlogged change to its real-time thread.
    ///
    /// A live context returns once all of its changes are applied. Otherwise
    /// as many as fit go onto the channel; a host that calls
    /// [`RtEngine::process`] without marking the engine live calls this
    /// between cycles until [`backlogged_events`](Self::backlogged_events) is
    /// zero.
    pub fn flush(&mut self) {
        for id in self.contexts() {
            if let Some(context) = self.contexts.get_mut(&id) {
                context.flush();
            }
        }
        self.reclaim();
    }

    /// Refuses user calls on clients an interface bridge owns.
    fn check_user_client(&self, ctx: ContextId, client: ClientId) -> Result<()> {
        let context = self.ctx(ctx)?;
        match context.role_of(client)? {
            ClientRole::Plain => Ok(()),
            _ => Err(EngineError::BridgeManaged(context.client_name(client)?.to_owned())),
        }
    }

    /// Marks the buffers of `ports` as held by the real-time thread until it
    /// hands them back.
    fn mark_pending(&mut self, ctx: ContextId, ports: &[PortId]) {
        for &port in ports {
            self.pending_free.insert(port, ctx);
        }
    }

    // --- Clients ---

    /// Opens an inactive client in the current context.
    pub fn open_client(&mut self, name: &str, policy: NamePolicy) -> Result<ClientId> {
        self.open_client_in(self.current(), name, policy)
    }

    /// Opens an inactive client in `ctx`.
    pub fn open_client_in(
        &mut self,
        ctx: ContextId,
        name: &str,
        policy: NamePolicy,
    ) -> Result<ClientId> {
        self.reclaim();
        let id = ClientId(self.next_client);
        self.ctx_mut(ctx)?.open_client(id, name, policy, ClientRole::Plain)?;
        self.next_client += 1;
        self.client_owner.insert(id, ctx);
        #[cfg(feature = "tracing")]
        tracing::debug!(%id, name, context = %ctx, "client opened");
        Ok(id)
    }

    /// Closes a client, removing its ports and connections.
    ///
    /// Macro clients are closed through [`delete`](Self::delete).
    pub fn close_client(&mut self, client: ClientId) -> Result<()> {
        self.reclaim();
        let ctx = self.client_ctx(client)?;
        self.check_user_client(ctx, client)?;
        let context = self.ctx_mut(ctx)?;
        let active = context.is_active(client)?;
        let key = context.client_key(client)?;
        let removed = context.close_client(key)?;
        for port in &removed {
            self.port_owner.remove(port);
        }
        if active {
            self.mark_pending(ctx, &removed);
        }
        self.client_owner.remove(&client);
        #[cfg(feature = "tracing")]
        tracing::debug!(%client, ports = removed.len(), "client closed");
        Ok(())
    }

    /// Adds a client and its ports to processing.
    pub fn activate(&mut self, client: ClientId) -> Result<()> {
        self.reclaim();
        let ctx = self.client_ctx(client)?;
        self.check_user_client(ctx, client)?;
        let context = self.ctx_mut(ctx)?;
        let key = context.client_key(client)?;
        context.activate(key)
    }

    /// Removes a client from processing. Its connections are kept.
    pub fn deactivate(&mut self, client: ClientId) -> Result<()> {
        self.reclaim();
        let ctx = self.client_ctx(client)?;
        self.check_user_client(ctx, client)?;
        let context = self.ctx_mut(ctx)?;
        let was_active = context.is_active(client)?;
        let key = context.client_key(client)?;
        context.deactivate(key)?;
        if was_active {
            let ports = self.ctx(ctx)?.client_ports(client)?;
            self.mark_pending(ctx, &ports);
        }
        Ok(())
    }

    /// Installs the process callback of an inactive client, replacing any
    /// previous one.
    pub fn set_process_handler(
        &mut self,
        client: ClientId,
        handler: impl ProcessHandler + 'static,
    ) -> Result<()> {
        self.set_boxed_handler(client, Box::new(handler))
    }

    /// [`set_process_handler`](Self::set_process_handler) for an already boxed
    /// handler.
    pub fn set_boxed_handler(
        &mut self,
        client: ClientId,
        handler: Box<dyn ProcessHandler>,
    ) -> Result<()> {
        self.reclaim();
        let ctx = self.client_ctx(client)?;
        self.check_user_client(ctx, client)?;
        let context = self.ctx_mut(ctx)?;
        let key = context.client_key(client)?;
        context.set_handler(key, handler)
    }

    /// Replaces a client's opaque property blob.
    pub fn set_client_properties(&mut self, client: ClientId, properties: Vec<u8>) -> Result<()> {
        let ctx = self.client_ctx(client)?;
        let context = self.ctx_mut(ctx)?;
        let key = context.client_key(client)?;
        context.graph.set_properties(key, properties)
    }

    /// Records the factory that created a client.
    pub fn set_client_factory(&mut self, client: ClientId, factory: Option<String>) -> Result<()> {
        let ctx = self.client_ctx(client)?;
        let context = self.ctx_mut(ctx)?;
        let key = context.client_key(client)?;
        context.graph.set_factory(key, factory)
    }

    /// Snapshot of a client and its ports.
    pub fn client_info(&self, client: ClientId) -> Result<ClientInfo> {
        self.ctx(self.client_ctx(client)?)?.graph.client_info(client)
    }

    /// Context owning a client.
    pub fn client_context(&self, client: ClientId) -> Result<ContextId> {
        self.client_ctx(client)
    }

    /// Every client of `ctx` in creation order.
    pub fn clients(&self, ctx: ContextId) -> Result<Vec<ClientInfo>> {
        Ok(self.ctx(ctx)?.graph.clients())
    }

    /// Looks up a client by name in the current context.
    pub fn client_by_name(&self, name: &str) -> Option<ClientId> {
        self.client_by_name_in(self.current(), name)
    }

    /// Looks up a client by name in `ctx`.
    pub fn client_by_name_in(&self, ctx: ContextId, name: &str) -> Option<ClientId> {
        self.contexts.get(&ctx)?.graph.client_by_name(name)
    }

    // --- Ports ---

    /// Registers a port on a client.
    ///
    /// If the client is active the port becomes visible to processing at once.
    pub fn register_port(
        &mut self,
        client: ClientId,
        short_name: &str,
        port_type: PortType,
        direction: PortDirection,
    ) -> Result<PortId> {
        self.reclaim();
        let ctx = self.client_ctx(client)?;
        self.check_user_client(ctx, client)?;
        self.register_port_unchecked(ctx, client, short_name, port_type, direction)
    }

    fn register_port_unchecked(
        &mut self,
        ctx: ContextId,
        client: ClientId,
        short_name: &str,
        port_type: PortType,
        direction: PortDirection,
    ) -> Result<PortId> {
        let id = PortId(self.next_port);
        let context = self.ctx_mut(ctx)?;
        let key = context.client_key(client)?;
        context.register_port(id, key, short_name, port_type, direction)?;
        self.next_port += 1;
        self.port_owner.insert(id, ctx);
        Ok(id)
    }

    /// Removes a port and its connections.
    pub fn unregister_port(&mut self, port: PortId) -> Result<()> {
        self.reclaim();
        let ctx = self.port_ctx(port)?;
        let client = self.ctx(ctx)?.owner_of(port)?;
        self.check_user_client(ctx, client)?;
        self.unregister_port_unchecked(ctx, port)
    }

    fn unregister_port_unchecked(&mut self, ctx: ContextId, port: PortId) -> Result<()> {
        let context = self.ctx_mut(ctx)?;
        let client = context.owner_of(port)?;
        let active = context.is_active(client)?;
        let key = context.port_key(port)?;
        context.unregister_port(key)?;
        self.port_owner.remove(&port);
        if active {
            self.pending_free.insert(port, ctx);
        }
        Ok(())
    }

    /// Changes a port's short name.
    pub fn rename_port(&mut self, port: PortId, short_name: &str) -> Result<()> {
        self.reclaim();
        let ctx = self.port_ctx(port)?;
        let context = self.ctx(ctx)?;
        self.check_user_client(ctx, context.owner_of(port)?)?;
        let context = self.ctx_mut(ctx)?;
        let key = context.port_key(port)?;
        context.rename_port(key, short_name)
    }

    /// Snapshot of a port.
    pub fn port_info(&self, port: PortId) -> Result<PortInfo> {
        self.ctx(self.port_ctx(port)?)?.graph.port_info(port)
    }

    /// Context owning a port.
    pub fn port_context(&self, port: PortId) -> Result<ContextId> {
        self.port_ctx(port)
    }

    /// Looks up a port by full `client:short` name in the current context.
    pub fn port_by_name(&self, full_name: &str) -> Option<PortId> {
        self.port_by_name_in(self.current(), full_name)
    }

    /// Looks up a port by full name in `ctx`.
    pub fn port_by_name_in(&self, ctx: ContextId, full_name: &str) -> Option<PortId> {
        self.contexts.get(&ctx)?.graph.port_by_name(full_name)
    }

    fn resolve_port(&self, ctx: ContextId, full_name: &str) -> Result<PortId> {
        self.port_by_name_in(ctx, full_name)
            .ok_or_else(|| EngineError::PortNotFound(full_name.to_owned()))
    }

    /// Full names of the ports of the current context matching every given
    /// filter. `pattern` is a regular expression searched in the full name.
    pub fn ports(
        &self,
        pattern: Option<&str>,
        port_type: Option<PortType>,
        direction: Option<PortDirection>,
    ) -> Result<Vec<String>> {
        self.ports_in(self.current(), pattern, port_type, direction)
    }

    /// [`ports`](Self::ports) for any context.
    pub fn ports_in(
        &self,
        ctx: ContextId,
        pattern: Option<&str>,
        port_type: Option<PortType>,
        direction: Option<PortDirection>,
    ) -> Result<Vec<String>> {
        let regex = pattern
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| EngineError::InvalidPattern(e.to_string()))?;
        Ok(self.ctx(ctx)?.graph.ports(regex.as_ref(), port_type, direction))
    }

    /// Full names of the ports connected to `port`.
    pub fn connections(&self, port: PortId) -> Result<Vec<String>> {
        self.ctx(self.port_ctx(port)?)?.graph.connections(port)
    }

    /// Every connection of `ctx` as `(output, input)` full names.
    pub fn connection_pairs(&self, ctx: ContextId) -> Result<Vec<(String, String)>> {
        let graph = &self.ctx(ctx)?.graph;
        graph
            .connection_pairs()
            .into_iter()
            .map(|(o, i)| {
                let name = |p: PortId| graph.port_info(p).map(|info| info.full_name);
                Ok((name(o)?, name(i)?))
            })
            .collect()
    }

    /// Connections of `ctx` that processing currently sees: both clients
    /// active.
    pub fn active_connections(&self, ctx: ContextId) -> Result<Vec<(PortId, PortId)>> {
        Ok(self.ctx(ctx)?.graph.active_connection_pairs())
    }

    // --- Connections ---

    /// Connects two ports of the same context. The order of `a` and `b` does
    /// not matter; one must be an output and the other an input.
    ///
    /// Connecting a free bridge port links it to a new port on the macro
    /// client and replaces it with a fresh free port.
    pub fn connect(&mut self, a: PortId, b: PortId) -> Result<()> {
        self.reclaim();
        let ctx = self.port_ctx(a)?;
        if self.port_ctx(b)? != ctx {
            return Err(EngineError::PortNotFound(b.to_string()));
        }
        let (output, input) = self.orient(ctx, a, b)?;
        let context = self.ctx(ctx)?;
        let (out_key, in_key) = (context.port_key(output)?, context.port_key(input)?);
        context.graph.check_connect(out_key, in_key)?;
        let mut plans = Vec::new();
        for port in [output, input] {
            plans.extend(self.plan_link(ctx, port)?);
        }

        self.ctx_mut(ctx)?.connect(out_key, in_key)?;
        if let Err(e) = self.grow_bridges(plans) {
            self.ctx_mut(ctx)?.disconnect(out_key, in_key)?;
            return Err(e);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(%output, %input, context = %ctx, "connected");
        Ok(())
    }

    /// Removes the connection between two ports.
    pub fn disconnect(&mut self, a: PortId, b: PortId) -> Result<()> {
        self.reclaim();
        let ctx = self.port_ctx(a)?;
        if self.port_ctx(b)? != ctx {
            return Err(EngineError::PortNotFound(b.to_string()));
        }
        let (output, input) = self.orient(ctx, a, b)?;
        let context = self.ctx_mut(ctx)?;
        let (out_key, in_key) = (context.port_key(output)?, context.port_key(input)?);
        context.disconnect(out_key, in_key)
    }

    /// Puts the output first. Two ports of one direction come back unchanged
    /// so the graph reports the mismatch.
    fn orient(&self, ctx: ContextId, a: PortId, b: PortId) -> Result<(PortId, PortId)> {
        let graph = &self.ctx(ctx)?.graph;
        let a_dir = graph.port_info(a)?.direction;
        let b_dir = graph.port_info(b)?.direction;
        Ok(match (a_dir, b_dir) {
            (PortDirection::Input, PortDirection::Output) => (b, a),
            _ => (a, b),
        })
    }

    /// Connects two ports of the current context by full name.
    pub fn connect_by_name(&mut self, a: &str, b: &str) -> Result<()> {
        self.connect_by_name_in(self.current(), a, b)
    }

    /// Connects two ports of `ctx` by full name.
    pub fn connect_by_name_in(&mut self, ctx: ContextId, a: &str, b: &str) -> Result<()> {
        let a = self.resolve_port(ctx, a)?;
        let b = self.resolve_port(ctx, b)?;
        self.connect(a, b)
    }

    /// Disconnects two ports of the current context by full name.
    pub fn disconnect_by_name(&mut self, a: &str, b: &str) -> Result<()> {
        self.disconnect_by_name_in(self.current(), a, b)
    }

    /// Disconnects two ports of `ctx` by full name.
    pub fn disconnect_by_name_in(&mut self, ctx: ContextId, a: &str, b: &str) -> Result<()> {
        let a = self.resolve_port(ctx, a)?;
        let b = self.resolve_port(ctx, b)?;
        self.disconnect(a, b)
    }

    // --- Bridge growth ---

    /// Plans linking `port` if it is an unlinked port of a bridge client of
    /// `ctx`. Fails if either new port name would be rejected.
    fn plan_link(&self, ctx: ContextId, port: PortId) -> Result<Option<LinkPlan>> {
        let context = self.ctx(ctx)?;
        let Some(bridge) = context.bridge() else {
            return Ok(None);
        };
        if bridge.is_linked(port) {
            return Ok(None);
        }
        let info = context.graph.port_info(port)?;
        let Some(side) = bridge.side_of(info.client) else {
            return Ok(None);
        };
        let bridge_info = context.graph.client_info(info.client)?;
        let free_name = free_port_name(
            info.port_type,
            bridge_info.ports.iter().map(|p| p.short_name.as_str()),
        );
        context
            .graph
            .check_new_port(context.client_key(info.client)?, &free_name)?;

        let upper_name = derived_port_name(&bridge_info.name, &info.short_name);
        let parent = self.ctx(bridge.parent)?;
        parent
            .graph
            .check_new_port(parent.client_key(bridge.macro_client)?, &upper_name)?;

        Ok(Some(LinkPlan {
            ctx,
            parent: bridge.parent,
            port,
            bridge_client: info.client,
            macro_client: bridge.macro_client,
            side,
            port_type: info.port_type,
            direction: info.direction,
            factor: bridge.factor,
            upper_name,
            free_name,
        }))
    }

    /// Carries out link plans: registers every new port first, then links.
    ///
    /// If a registration fails, the ports registered so far are removed again
    /// and nothing is linked.
    fn grow_bridges(&mut self, plans: Vec<LinkPlan>) -> Result<()> {
        let mut registered = Vec::new();
        let mut ready = Vec::with_capacity(plans.len());
        for plan in &plans {
            match self.register_link_ports(plan, &mut registered) {
                Ok(ports) => ready.push(ports),
                Err(e) => {
                    for (ctx, port) in registered.into_iter().rev() {
                        self.unregister_port_unchecked(ctx, port)?;
                    }
                    return Err(e);
                }
            }
        }
        for (plan, ports) in plans.into_iter().zip(ready) {
            self.link(plan, ports);
        }
        Ok(())
    }

    /// Registers the replacement free port and the macro-client port of a
    /// plan, recording each in `registered`.
    fn register_link_ports(
        &mut self,
        plan: &LinkPlan,
        registered: &mut Vec<(ContextId, PortId)>,
    ) -> Result<LinkPorts> {
        let free = self.register_port_unchecked(
            plan.ctx,
            plan.bridge_client,
            &plan.free_name,
            plan.port_type,
            plan.direction,
        )?;
        registered.push((plan.ctx, free));
        let upper = self.register_port_unchecked(
            plan.parent,
            plan.macro_client,
            &plan.upper_name,
            plan.port_type,
            plan.direction.opposite(),
        )?;
        registered.push((plan.parent, upper));
        Ok(LinkPorts {
            upper,
            lower_key: self.ctx(plan.ctx)?.port_key(plan.port)?,
            upper_key: self.ctx(plan.parent)?.port_key(upper)?,
        })
    }

    /// Hands a planned pair to the child engine and records it.
    fn link(&mut self, plan: LinkPlan, ports: LinkPorts) {
        let resampler = Resampler::new(plan.factor, self.config.upsample);
        let Some(context) = self.contexts.get_mut(&plan.ctx) else {
            return;
        };
        context.link(BridgeLink::new(ports.lower_key, ports.upper_key, plan.side, resampler));
        if let Some(bridge) = context.bridge_mut() {
            bridge.links.push(LinkRecord {
                side: plan.side,
                lower: plan.port,
                upper: ports.upper,
            });
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            context = %plan.ctx,
            port = %plan.port,
            replacement = %plan.free_name,
            "bridge port linked"
        );
    }

    // --- Context stack ---

    /// The root context.
    pub fn root(&self) -> ContextId {
        self.root
    }

    /// The context on top of the stack.
    pub fn current(&self) -> ContextId {
        self.stack.last().copied().unwrap_or(self.root)
    }

    /// Contexts on the stack, root first.
    pub fn stack(&self) -> &[ContextId] {
        &self.stack
    }

    /// Every context, in creation order.
    pub fn contexts(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.contexts.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Creates a context nested in the current one and makes it current.
    ///
    /// In the current context the new context appears as an active macro
    /// client named `name`. Inside, an inlet and an outlet client each expose
    /// a free audio and MIDI port. The nested context runs at `oversampling`
    /// times the current context's rate.
    pub fn push(&mut self, name: &str, oversampling: u32) -> Result<ContextId> {
        self.reclaim();
        if oversampling == 0 || oversampling > MAX_OVERSAMPLING {
            return Err(EngineError::InvalidOversampling(oversampling));
        }
        let factor = oversampling as usize;
        let parent = self.current();
        let child = ContextId(self.next_context);

        let parent_ctx = self.ctx(parent)?;
        if parent_ctx.graph.client_by_name(name).is_some() {
            return Err(EngineError::NameInUse(name.to_owned()));
        }
        let frames = parent_ctx
            .spec
            .frames
            .checked_mul(factor)
            .filter(|&frames| frames <= MAX_CONTEXT_FRAMES)
            .ok_or(EngineError::InvalidOversampling(oversampling))?;
        let spec = BufferSpec {
            frames,
            midi_bytes: parent_ctx.spec.midi_bytes,
        };
        let sample_rate = parent_ctx.sample_rate * oversampling as f32;
        let parent_rendezvous: Arc<Rendezvous> = Arc::clone(parent_ctx.rendezvous());

        // Build the child fully before touching the parent.
        let (sender, receiver) = channel(
            self.config.channel_capacity,
            self.config.reclaim_capacity,
            Some(parent_rendezvous),
        );
        let engine = RtEngine::new(receiver, spec.frames, spec.midi_bytes);
        let mut context = Context::new(
            name.to_owned(),
            ClientGraph::new(self.config.max_client_name, self.config.max_port_name),
            sender,
            Backend::Root,
            spec,
            sample_rate,
        );

        let mut next_client = self.next_client;
        let mut next_port = self.next_port;
        let mut take_client = || {
            next_client += 1;
            ClientId(next_client - 1)
        };
        let macro_client = take_client();
        let inlet = take_client();
        let outlet = take_client();

        let mut bridge_ports = Vec::with_capacity(4);
        for (id, side) in [(inlet, BridgeSide::Inlet), (outlet, BridgeSide::Outlet)] {
            let (bridge_name, role) = match side {
                BridgeSide::Inlet => (&self.config.inlet_name, ClientRole::Inlet),
                BridgeSide::Outlet => (&self.config.outlet_name, ClientRole::Outlet),
            };
            let key = context.open_client(id, bridge_name, NamePolicy::Exact, role)?;
            for port_type in [PortType::Audio, PortType::Midi] {
                let port = PortId(next_port);
                next_port += 1;
                let short = free_port_name(port_type, []);
                context.register_port(port, key, &short, port_type, side.child_direction())?;
                bridge_ports.push(port);
            }
            context.activate(key)?;
        }
        context.backend = Backend::Nested(InterfaceBridge {
            parent,
            macro_client,
            inlet,
            outlet,
            factor,
            links: Vec::new(),
        });

        let parent_ctx = self.ctx_mut(parent)?;
        let macro_key =
            parent_ctx.open_client(macro_client, name, NamePolicy::Exact, ClientRole::Macro(child))?;
        let handler = Box::new(MacroHandler::new(engine, factor));
        if let Err(e) = parent_ctx.install_and_activate(macro_key, handler) {
            parent_ctx.close_client(macro_key)?;
            return Err(e);
        }
        parent_ctx.children.push(child);

        self.next_context += 1;
        self.next_client = next_client;
        self.next_port = next_port;
        self.client_owner.insert(macro_client, parent);
        self.client_owner.insert(inlet, child);
        self.client_owner.insert(outlet, child);
        for port in bridge_ports {
            self.port_owner.insert(port, child);
        }
        self.contexts.insert(child, context);
        self.stack.push(child);

        #[cfg(feature = "tracing")]
        tracing::info!(context = %child, parent = %parent, name, oversampling, "context pushed");
        Ok(child)
    }

    /// Makes an existing child of the current context current again.
    pub fn push_existing(&mut self, ctx: ContextId) -> Result<()> {
        let parent = self.ctx(ctx)?.require_nested(ctx)?.parent;
        if parent != self.current() {
            return Err(EngineError::NotChild(ctx));
        }
        self.stack.push(ctx);
        Ok(())
    }

    /// Returns to the parent of the current context. The popped context
    /// keeps running.
    pub fn pop(&mut self) -> Result<ContextId> {
        if self.stack.len() <= 1 {
            return Err(EngineError::LastContext);
        }
        self.stack.pop();
        Ok(self.current())
    }

    /// Destroys a nested context, its descendants and its macro client.
    pub fn delete(&mut self, ctx: ContextId) -> Result<()> {
        self.reclaim();
        let bridge = self.ctx(ctx)?.require_nested(ctx)?;
        if self.stack.contains(&ctx) {
            return Err(EngineError::ContextInUse(ctx));
        }
        let parent = bridge.parent;
        let macro_client = bridge.macro_client;

        let parent_ctx = self.ctx_mut(parent)?;
        let key = parent_ctx.client_key(macro_client)?;
        let removed = parent_ctx.close_client(key)?;
        parent_ctx.children.retain(|&c| c != ctx);
        for port in &removed {
            self.port_owner.remove(port);
        }
        self.mark_pending(parent, &removed);
        self.client_owner.remove(&macro_client);

        // The child engines travel back with the macro handler; nothing below
        // needs events of its own.
        let mut doomed = vec![ctx];
        while let Some(id) = doomed.pop() {
            let Some(context) = self.contexts.remove(&id) else {
                continue;
            };
            doomed.extend(context.children.iter().copied());
            for client in context.graph.clients() {
                self.client_owner.remove(&client.id);
                for port in client.ports {
                    self.port_owner.remove(&port.id);
                }
            }
            self.pending_free.retain(|_, owner| *owner != id);
        }
        #[cfg(feature = "tracing")]
        tracing::info!(context = %ctx, "context deleted");
        Ok(())
    }

    // --- Context queries ---

    /// Name of a context: the macro client's name, or `root`.
    pub fn context_name(&self, ctx: ContextId) -> Result<&str> {
        Ok(self.ctx(ctx)?.name.as_str())
    }

    /// Parent of a nested context; `None` for the root.
    pub fn parent(&self, ctx: ContextId) -> Result<Option<ContextId>> {
        Ok(self.ctx(ctx)?.bridge().map(|b| b.parent))
    }

    /// Direct children of a context in creation order.
    pub fn children(&self, ctx: ContextId) -> Result<Vec<ContextId>> {
        Ok(self.ctx(ctx)?.children.clone())
    }

    /// Macro client standing for `ctx` in its parent.
    pub fn macro_client(&self, ctx: ContextId) -> Result<ClientId> {
        Ok(self.ctx(ctx)?.require_nested(ctx)?.macro_client)
    }

    /// Inlet or outlet client of a nested context.
    pub fn bridge_client(&self, ctx: ContextId, side: BridgeSide) -> Result<ClientId> {
        Ok(self.ctx(ctx)?.require_nested(ctx)?.client_of(side))
    }

    /// Rate factor of `ctx` relative to its parent; 1 for the root.
    pub fn oversampling(&self, ctx: ContextId) -> Result<u32> {
        Ok(self.ctx(ctx)?.bridge().map_or(1, |b| b.factor as u32))
    }

    /// Sample rate of `ctx` in Hz.
    pub fn sample_rate(&self, ctx: ContextId) -> Result<f32> {
        Ok(self.ctx(ctx)?.sample_rate)
    }

    /// Frames per cycle in `ctx`.
    pub fn frames(&self, ctx: ContextId) -> Result<usize> {
        Ok(self.ctx(ctx)?.spec.frames)
    }

    /// Returns true while a real-time thread drives `ctx`.
    pub fn is_live(&self, ctx: ContextId) -> Result<bool> {
        Ok(self.ctx(ctx)?.rendezvous().is_live())
    }

    /// Events of `ctx` not yet applied by its real-time thread.
    pub fn pending_events(&self, ctx: ContextId) -> Result<usize> {
        Ok(self.ctx(ctx)?.pending_events())
    }

    /// Events of `ctx` still waiting for room on its change channel.
    pub fn backlogged_events(&self, ctx: ContextId) -> Result<usize> {
        Ok(self.ctx(ctx)?.backlogged_events())
    }

    /// Ports whose buffers a real-time thread has not handed back yet.
    pub fn pending_free(&self) -> usize {
        self.pending_free.len()
    }

    /// Linked bridge ports of a nested context, in link order.
    pub fn bridge_ports(&self, ctx: ContextId) -> Result<Vec<BridgePort>> {
        let context = self.ctx(ctx)?;
        let bridge = context.require_nested(ctx)?;
        bridge
            .links
            .iter()
            .map(|link| {
                let info = context.graph.port_info(link.lower)?;
                Ok(BridgePort {
                    side: link.side,
                    short_name: info.short_name,
                    port_type: info.port_type,
                    child_port: link.lower,
                    parent_port: link.upper,
                })
            })
            .collect()
    }

    /// Makes sure a bridge client of `ctx` has a linked port named
    /// `short_name`, creating and linking it if needed.
    ///
    /// Used to rebuild a saved context with its exact bridge layout.
    pub fn ensure_bridge_port(
        &mut self,
        ctx: ContextId,
        side: BridgeSide,
        short_name: &str,
        port_type: PortType,
    ) -> Result<PortId> {
        self.reclaim();
        let context = self.ctx(ctx)?;
        let client = context.require_nested(ctx)?.client_of(side);
        let existing = context
            .graph
            .client_info(client)?
            .ports
            .into_iter()
            .find(|p| p.short_name == short_name);
        let (port, created) = match existing {
            Some(info) if info.port_type != port_type => {
                return Err(EngineError::NameInUse(info.full_name));
            }
            Some(info) => (info.id, false),
            None => {
                let port = self.register_port_unchecked(
                    ctx,
                    client,
                    short_name,
                    port_type,
                    side.child_direction(),
                )?;
                (port, true)
            }
        };
        let grown = self
            .plan_link(ctx, port)
            .and_then(|plan| self.grow_bridges(plan.into_iter().collect()));
        if let Err(e) = grown {
            if created {
                self.unregister_port_unchecked(ctx, port)?;
            }
            return Err(e);
        }
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ContextRouter {
        ContextRouter::new(EngineConfig::default()).0
    }

    fn audio_client(r: &mut ContextRouter, name: &str) -> (ClientId, PortId, PortId) {
        let c = r.open_client(name, NamePolicy::Exact).unwrap();
        let i = r.register_port(c, "in", PortType::Audio, PortDirection::Input).unwrap();
        let o = r.register_port(c, "out", PortType::Audio, PortDirection::Output).unwrap();
        (c, i, o)
    }

    // --- Clients and ports ---

    #[test]
    fn test_handles_resolve_across_contexts() {
        let mut r = router();
        let (a, _, out) = audio_client(&mut r, "a");
        let fx = r.push("fx", 1).unwrap();
        assert_eq!(r.client_context(a).unwrap(), r.root());
        assert_eq!(r.port_info(out).unwrap().full_name, "a:out");
        // unqualified lookups follow the stack
        assert_eq!(r.client_by_name("a"), None);
        assert!(r.client_by_name("inlet").is_some());
        assert_eq!(r.current(), fx);
    }

    #[test]
    fn test_connect_orients_endpoints() {
        let mut r = router();
        let (_, a_in, _) = audio_client(&mut r, "a");
        let (_, _, b_out) = audio_client(&mut r, "b");
        r.connect(a_in, b_out).unwrap();
        assert_eq!(r.connections(a_in).unwrap(), vec!["b:out"]);
        assert_eq!(
            r.connection_pairs(r.root()).unwrap(),
            vec![("b:out".to_owned(), "a:in".to_owned())]
        );
        r.disconnect_by_name("a:in", "b:out").unwrap();
        assert!(r.connections(a_in).unwrap().is_empty());
    }

    #[test]
    fn test_ports_pattern_errors() {
        let r = router();
        assert!(matches!(
            r.ports(Some("("), None, None),
            Err(EngineError::InvalidPattern(_))
        ));
        assert!(r.ports(Some(""), None, None).unwrap().is_empty());
    }

    #[test]
    fn test_active_port_buffers_pending_until_reclaimed() {
        let (mut r, mut engine) = ContextRouter::new(EngineConfig::default());
        let (a, _, out) = audio_client(&mut r, "a");
        r.activate(a).unwrap();
        engine.process(64).unwrap();
        r.unregister_port(out).unwrap();
        assert_eq!(r.pending_free(), 1);
        engine.process(64).unwrap();
        // the next call collects the returned buffer
        r.open_client("b", NamePolicy::Exact).unwrap();
        assert_eq!(r.pending_free(), 0);
    }

    // --- Context stack ---

    #[test]
    fn test_push_creates_macro_and_bridge() {
        let mut r = router();
        let fx = r.push("fx", 4).unwrap();
        assert_eq!(r.parent(fx).unwrap(), Some(r.root()));
        assert_eq!(r.oversampling(fx).unwrap(), 4);
        assert_eq!(r.frames(fx).unwrap(), 256 * 4);
        assert_eq!(r.sample_rate(fx).unwrap(), 192000.0);

        let mac = r.macro_client(fx).unwrap();
        let info = r.client_info(mac).unwrap();
        assert!(info.active);
        assert_eq!(info.role, ClientRole::Macro(fx));
        assert!(info.ports.is_empty());

        assert_eq!(
            r.ports(None, None, None).unwrap(),
            vec!["inlet:audio_1", "inlet:midi_1", "outlet:audio_1", "outlet:midi_1"]
        );
    }

    #[test]
    fn test_push_rejections() {
        let mut r = router();
        audio_client(&mut r, "a");
        assert!(matches!(r.push("fx", 0), Err(EngineError::InvalidOversampling(0))));
        assert!(matches!(r.push("a", 2), Err(EngineError::NameInUse(_))));
        assert_eq!(r.contexts(), vec![r.root()]);
        assert!(matches!(r.pop(), Err(EngineError::LastContext)));
    }

    #[test]
    fn test_pop_and_push_existing() {
        let mut r = router();
        let fx = r.push("fx", 1).unwrap();
        let inner = r.push("inner", 2).unwrap();
        assert_eq!(r.pop().unwrap(), fx);
        assert_eq!(r.pop().unwrap(), r.root());
        assert!(matches!(r.push_existing(inner), Err(EngineError::NotChild(_))));
        assert!(matches!(r.push_existing(r.root()), Err(EngineError::NotNested(_))));
        r.push_existing(fx).unwrap();
        r.push_existing(inner).unwrap();
        assert_eq!(r.stack(), &[r.root(), fx, inner]);
        assert_eq!(r.frames(inner).unwrap(), 512);
    }

    #[test]
    fn test_delete_removes_subtree() {
        let mut r = router();
        let fx = r.push("fx", 1).unwrap();
        let inner = r.push("inner", 1).unwrap();
        let inlet = r.bridge_client(inner, BridgeSide::Inlet).unwrap();
        assert!(matches!(r.delete(inner), Err(EngineError::ContextInUse(_))));
        r.pop().unwrap();
        r.pop().unwrap();
        assert!(matches!(r.delete(r.root()), Err(EngineError::NotNested(_))));

        r.delete(fx).unwrap();
        assert_eq!(r.contexts(), vec![r.root()]);
        assert!(r.client_by_name("fx").is_none());
        assert!(matches!(r.client_info(inlet), Err(EngineError::ClientNotFound(_))));
        assert!(matches!(r.frames(inner), Err(EngineError::ContextNotFound(_))));
    }

    // --- Bridge ---

    #[test]
    fn test_bridge_clients_are_protected() {
        let mut r = router();
        let fx = r.push("fx", 1).unwrap();
        let inlet = r.bridge_client(fx, BridgeSide::Inlet).unwrap();
        assert!(matches!(r.close_client(inlet), Err(EngineError::BridgeManaged(_))));
        assert!(matches!(r.deactivate(inlet), Err(EngineError::BridgeManaged(_))));
        assert!(matches!(
            r.register_port(inlet, "x", PortType::Audio, PortDirection::Output),
            Err(EngineError::BridgeManaged(_))
        ));
        r.pop().unwrap();
        let mac = r.macro_client(fx).unwrap();
        assert!(matches!(r.close_client(mac), Err(EngineError::BridgeManaged(_))));
    }

    #[test]
    fn test_connecting_free_port_grows_pool() {
        let mut r = router();
        let fx = r.push("fx", 2).unwrap();
        let (_, fx_in, _) = audio_client(&mut r, "verb");
        r.connect_by_name("inlet:audio_1", "verb:in").unwrap();

        let bridge = r.bridge_ports(fx).unwrap();
        assert_eq!(bridge.len(), 1);
        assert_eq!(bridge[0].side, BridgeSide::Inlet);
        assert_eq!(bridge[0].short_name, "audio_1");
        assert_eq!(r.connections(fx_in).unwrap(), vec!["inlet:audio_1"]);

        assert_eq!(
            r.ports(Some("^inlet:"), None, None).unwrap(),
            vec!["inlet:audio_1", "inlet:midi_1", "inlet:audio_2"]
        );
        let upper = r.port_info(bridge[0].parent_port).unwrap();
        assert_eq!(upper.full_name, "fx:inlet_audio_1");
        assert_eq!(upper.direction, PortDirection::Input);

        // a second connection to a linked port adds nothing
        let (_, other_in, _) = audio_client(&mut r, "comp");
        r.connect_by_name("inlet:audio_1", "comp:in").unwrap();
        assert_eq!(r.bridge_ports(fx).unwrap().len(), 1);
        assert_eq!(r.connections(other_in).unwrap(), vec!["inlet:audio_1"]);
    }

    #[test]
    fn test_failed_bridge_growth_leaves_no_connection() {
        let (mut r, _engine) = ContextRouter::new(EngineConfig {
            max_port_name: 16,
            ..EngineConfig::default()
        });
        // "effects:inlet_audio_1" does not fit
        let fx = r.push("effects", 2).unwrap();
        let (_, verb_in, _) = audio_client(&mut r, "verb");
        let before = r.ports(None, None, None).unwrap();

        let result = r.connect_by_name("inlet:audio_1", "verb:in");
        assert!(matches!(result, Err(EngineError::NameTooLong { .. })));
        assert!(r.connections(verb_in).unwrap().is_empty());
        assert!(r.bridge_ports(fx).unwrap().is_empty());
        assert_eq!(r.ports(None, None, None).unwrap(), before);
        let mac = r.macro_client(fx).unwrap();
        assert!(r.client_info(mac).unwrap().ports.is_empty());
        assert_eq!(r.pending_free(), 0);
    }

    #[test]
    fn test_failed_ensure_bridge_port_removes_new_port() {
        let (mut r, _engine) = ContextRouter::new(EngineConfig {
            max_port_name: 16,
            ..EngineConfig::default()
        });
        let fx = r.push("effects", 2).unwrap();
        assert!(
            r.ensure_bridge_port(fx, BridgeSide::Inlet, "audio_5", PortType::Audio)
                .is_err()
        );
        assert_eq!(
            r.ports(Some("^inlet:"), None, None).unwrap(),
            vec!["inlet:audio_1", "inlet:midi_1"]
        );
        assert!(r.bridge_ports(fx).unwrap().is_empty());
    }

    #[test]
    fn test_push_bounds_oversampling() {
        let (mut r, _engine) = ContextRouter::new(EngineConfig {
            frames: 1024,
            ..EngineConfig::default()
        });
        assert!(matches!(
            r.push("fx", u32::MAX),
            Err(EngineError::InvalidOversampling(u32::MAX))
        ));
        assert!(matches!(
            r.push("fx", MAX_OVERSAMPLING + 1),
            Err(EngineError::InvalidOversampling(_))
        ));
        let outer = r.push("outer", MAX_OVERSAMPLING).unwrap();
        assert_eq!(r.frames(outer).unwrap(), 1024 * 64);
        // 1024 * 64 * 64 frames is past MAX_CONTEXT_FRAMES
        assert!(matches!(
            r.push("inner", MAX_OVERSAMPLING),
            Err(EngineError::InvalidOversampling(64))
        ));
        assert_eq!(r.contexts(), vec![r.root(), outer]);
    }

    #[test]
    fn test_ensure_bridge_port_reproduces_names() {
        let mut r = router();
        let fx = r.push("fx", 1).unwrap();
        let p = r
            .ensure_bridge_port(fx, BridgeSide::Outlet, "midi_1", PortType::Midi)
            .unwrap();
        let again = r
            .ensure_bridge_port(fx, BridgeSide::Outlet, "midi_1", PortType::Midi)
            .unwrap();
        assert_eq!(p, again);
        assert!(matches!(
            r.ensure_bridge_port(fx, BridgeSide::Outlet, "midi_2", PortType::Audio),
            Err(EngineError::NameInUse(_))
        ));
        let linked: Vec<_> = r.bridge_ports(fx).unwrap().into_iter().map(|b| b.short_name).collect();
        assert_eq!(linked, vec!["midi_1"]);
        assert!(r.port_by_name_in(r.root(), "fx:outlet_midi_1").is_some());
    }
}
