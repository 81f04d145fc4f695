//! Saving and loading context subtrees.
//!
//! A patch is a versioned JSON document describing one context: its clients
//! in creation order, then its connections as `(output, input)` full names.
//! Each client is either
//!
//! - a **macro**, recorded with its oversampling factor, the linked ports of
//!   its inlet and outlet, and the nested context itself; or
//! - a **plain** client, recorded with its factory id, the factory's opaque
//!   state, and its port list.
//!
//! Bridge clients are not recorded: pushing the context recreates them, and
//! the macro record lists which of their ports must be linked before the
//! nested connections are restored.
//!
//! Loading is best-effort for missing pieces. A client whose factory is not in
//! the registry is skipped with a warning, and so is every connection that
//! touches one of its ports. Engine errors, such as a name already taken in
//! the target context, abort the load and leave whatever was restored so far.
//!
//! ```rust
//! use nido_config::persist;
//! use nido_core::{ContextRouter, EngineConfig};
//! use nido_registry::ClientRegistry;
//!
//! let registry = ClientRegistry::with_builtins();
//! let (mut router, _engine) = ContextRouter::new(EngineConfig::default());
//! registry.create("gain", &mut router, "vol").unwrap();
//!
//! let mut bytes = Vec::new();
//! persist::save(&router, &registry, router.root(), &mut bytes).unwrap();
//!
//! let (mut copy, _engine) = ContextRouter::new(EngineConfig::default());
//! let report = persist::load(&mut copy, &registry, bytes.as_slice()).unwrap();
//! assert_eq!(report.clients.len(), 1);
//! ```

use crate::error::ConfigError;
use nido_core::{
    BridgeSide, ClientId, ClientInfo, ClientRole, ContextId, ContextRouter, NamePolicy,
    PortDirection, PortInfo, PortType,
};
use nido_registry::{ClientRegistry, FactoryError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Current patch format version.
pub const PATCH_VERSION: u32 = 1;

/// A saved context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchDocument {
    /// Format version.
    pub version: u32,
    /// The saved context.
    pub context: ContextRecord,
}

/// Clients and connections of one context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    /// Clients in creation order, bridge clients excluded.
    #[serde(default)]
    pub clients: Vec<ClientRecord>,
    /// Connections in connection order.
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
}

/// One `output -> input` connection by full port names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Output port full name.
    pub output: String,
    /// Input port full name.
    pub input: String,
}

/// A saved client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Client name.
    pub name: String,
    /// Opaque property blob.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<u8>,
    /// Whether the client was active.
    #[serde(default)]
    pub active: bool,
    /// Ports in registration order. Empty for macros.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortRecord>,
    /// Macro or plain payload.
    #[serde(flatten)]
    pub body: ClientBody,
}

/// What kind of client a record describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientBody {
    /// Stands for a nested context.
    Macro {
        /// Rate multiple of the nested context.
        oversampling: u32,
        /// Linked inlet ports in link order.
        #[serde(default)]
        inlet_ports: Vec<BridgePortRecord>,
        /// Linked outlet ports in link order.
        #[serde(default)]
        outlet_ports: Vec<BridgePortRecord>,
        /// The nested context.
        context: ContextRecord,
    },
    /// An ordinary client.
    Plain {
        /// Factory id, if a factory built the client.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        factory: Option<String>,
        /// Factory state bytes.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        state: Vec<u8>,
    },
}

/// A port of a plain client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    /// Short name.
    pub name: String,
    /// Data type.
    #[serde(rename = "type")]
    pub port_type: PortType,
    /// Direction.
    pub direction: PortDirection,
}

impl From<&PortInfo> for PortRecord {
    fn from(info: &PortInfo) -> Self {
        Self {
            name: info.short_name.clone(),
            port_type: info.port_type,
            direction: info.direction,
        }
    }
}

/// A linked bridge port of a macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgePortRecord {
    /// Short name on the bridge client.
    pub name: String,
    /// Data type.
    #[serde(rename = "type")]
    pub port_type: PortType,
}

/// What a load restored and what it skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Restored plain clients, in every context.
    pub clients: Vec<ClientId>,
    /// Recreated nested contexts.
    pub contexts: Vec<ContextId>,
    /// Names of clients skipped for an unknown factory.
    pub skipped_clients: Vec<String>,
    /// Connections skipped because an endpoint was missing.
    pub skipped_connections: Vec<(String, String)>,
}

impl LoadReport {
    /// Returns true if nothing was skipped.
    pub fn is_complete(&self) -> bool {
        self.skipped_clients.is_empty() && self.skipped_connections.is_empty()
    }
}

// --- Save ---

/// Describes `ctx` and everything nested in it.
pub fn record(
    router: &ContextRouter,
    registry: &ClientRegistry,
    ctx: ContextId,
) -> Result<ContextRecord, ConfigError> {
    let mut clients = Vec::new();
    for info in router.clients(ctx)? {
        if let Some(client) = record_client(router, registry, info)? {
            clients.push(client);
        }
    }
    let connections = router
        .connection_pairs(ctx)?
        .into_iter()
        .map(|(output, input)| ConnectionRecord { output, input })
        .collect();
    Ok(ContextRecord {
        clients,
        connections,
    })
}

fn record_client(
    router: &ContextRouter,
    registry: &ClientRegistry,
    info: ClientInfo,
) -> Result<Option<ClientRecord>, ConfigError> {
    let (body, ports) = match info.role {
        ClientRole::Inlet | ClientRole::Outlet => return Ok(None),
        ClientRole::Macro(child) => {
            let mut inlet_ports = Vec::new();
            let mut outlet_ports = Vec::new();
            for port in router.bridge_ports(child)? {
                let record = BridgePortRecord {
                    name: port.short_name,
                    port_type: port.port_type,
                };
                match port.side {
                    BridgeSide::Inlet => inlet_ports.push(record),
                    BridgeSide::Outlet => outlet_ports.push(record),
                }
            }
            let body = ClientBody::Macro {
                oversampling: router.oversampling(child)?,
                inlet_ports,
                outlet_ports,
                context: record(router, registry, child)?,
            };
            (body, Vec::new())
        }
        ClientRole::Plain => {
            let state = match &info.factory {
                Some(id) if registry.contains(id) => registry.save_state(id, router, info.id)?,
                _ => Vec::new(),
            };
            let body = ClientBody::Plain {
                factory: info.factory.clone(),
                state,
            };
            (body, info.ports.iter().map(PortRecord::from).collect())
        }
    };
    Ok(Some(ClientRecord {
        name: info.name,
        properties: info.properties,
        active: info.active,
        ports,
        body,
    }))
}

/// Writes `ctx` and everything nested in it to `writer`.
pub fn save(
    router: &ContextRouter,
    registry: &ClientRegistry,
    ctx: ContextId,
    writer: impl Write,
) -> Result<(), ConfigError> {
    let document = PatchDocument {
        version: PATCH_VERSION,
        context: record(router, registry, ctx)?,
    };
    serde_json::to_writer_pretty(writer, &document)?;
    tracing::debug!(context = %ctx, clients = document.context.clients.len(), "context saved");
    Ok(())
}

/// Saves `ctx` to a file, creating parent directories.
pub fn save_to_path(
    router: &ContextRouter,
    registry: &ClientRegistry,
    ctx: ContextId,
    path: impl AsRef<Path>,
) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
    }
    let file = File::create(path).map_err(|e| ConfigError::write_file(path, e))?;
    let mut writer = BufWriter::new(file);
    save(router, registry, ctx, &mut writer)?;
    writer.flush().map_err(|e| ConfigError::write_file(path, e))
}

// --- Load ---

/// Parses a patch document, rejecting newer versions.
pub fn read_document(reader: impl Read) -> Result<PatchDocument, ConfigError> {
    let document: PatchDocument = serde_json::from_reader(reader)?;
    if document.version > PATCH_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            found: document.version,
            supported: PATCH_VERSION,
        });
    }
    Ok(document)
}

/// Restores a saved context into the router's current context.
pub fn load(
    router: &mut ContextRouter,
    registry: &ClientRegistry,
    reader: impl Read,
) -> Result<LoadReport, ConfigError> {
    let document = read_document(reader)?;
    let mut report = LoadReport::default();
    restore(router, registry, &document.context, &mut report)?;
    tracing::info!(
        clients = report.clients.len(),
        contexts = report.contexts.len(),
        skipped = report.skipped_clients.len() + report.skipped_connections.len(),
        "patch loaded"
    );
    Ok(report)
}

/// Loads a patch file into the router's current context.
pub fn load_from_path(
    router: &mut ContextRouter,
    registry: &ClientRegistry,
    path: impl AsRef<Path>,
) -> Result<LoadReport, ConfigError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| ConfigError::read_file(path, e))?;
    load(router, registry, BufReader::new(file))
}

/// Restores `record` into the current context.
fn restore(
    router: &mut ContextRouter,
    registry: &ClientRegistry,
    record: &ContextRecord,
    report: &mut LoadReport,
) -> Result<(), ConfigError> {
    for client in &record.clients {
        match &client.body {
            ClientBody::Macro {
                oversampling,
                inlet_ports,
                outlet_ports,
                context,
            } => {
                let child = router.push(&client.name, *oversampling)?;
                report.contexts.push(child);
                let filled =
                    fill_nested(router, registry, child, inlet_ports, outlet_ports, context, report);
                router.pop()?;
                filled?;
                if !client.properties.is_empty() {
                    let macro_client = router.macro_client(child)?;
                    router.set_client_properties(macro_client, client.properties.clone())?;
                }
            }
            ClientBody::Plain { factory, state } => {
                restore_plain(router, registry, client, factory.as_deref(), state, report)?;
            }
        }
    }

    let ctx = router.current();
    for connection in &record.connections {
        let present = router.port_by_name_in(ctx, &connection.output).is_some()
            && router.port_by_name_in(ctx, &connection.input).is_some();
        if !present {
            tracing::warn!(
                output = %connection.output,
                input = %connection.input,
                "skipping connection with a missing endpoint"
            );
            report
                .skipped_connections
                .push((connection.output.clone(), connection.input.clone()));
            continue;
        }
        router.connect_by_name_in(ctx, &connection.output, &connection.input)?;
    }
    Ok(())
}

/// Links the saved bridge ports of a freshly pushed context and restores its
/// contents. `child` must be current.
fn fill_nested(
    router: &mut ContextRouter,
    registry: &ClientRegistry,
    child: ContextId,
    inlet_ports: &[BridgePortRecord],
    outlet_ports: &[BridgePortRecord],
    context: &ContextRecord,
    report: &mut LoadReport,
) -> Result<(), ConfigError> {
    let sides = [
        (BridgeSide::Inlet, inlet_ports),
        (BridgeSide::Outlet, outlet_ports),
    ];
    for (side, ports) in sides {
        for port in ports {
            router.ensure_bridge_port(child, side, &port.name, port.port_type)?;
        }
    }
    restore(router, registry, context, report)
}

fn restore_plain(
    router: &mut ContextRouter,
    registry: &ClientRegistry,
    record: &ClientRecord,
    factory: Option<&str>,
    state: &[u8],
    report: &mut LoadReport,
) -> Result<(), ConfigError> {
    let client = match factory {
        Some(id) => match registry.create(id, router, &record.name) {
            Ok(client) => client,
            Err(FactoryError::Unknown(_)) => {
                tracing::warn!(client = %record.name, factory = id, "skipping client with unknown factory");
                report.skipped_clients.push(record.name.clone());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        },
        None => router.open_client(&record.name, NamePolicy::Exact)?,
    };
    if let Some(id) = factory
        && !state.is_empty()
    {
        registry.load_state(id, router, client, state)?;
    }

    let existing: Vec<String> = router
        .client_info(client)?
        .ports
        .into_iter()
        .map(|p| p.short_name)
        .collect();
    for port in &record.ports {
        if !existing.contains(&port.name) {
            router.register_port(client, &port.name, port.port_type, port.direction)?;
        }
    }
    if !record.properties.is_empty() {
        router.set_client_properties(client, record.properties.clone())?;
    }
    if record.active {
        router.activate(client)?;
    }
    report.clients.push(client);
    Ok(())
}
