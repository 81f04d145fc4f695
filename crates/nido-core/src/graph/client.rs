//! Client identity and metadata.

use super::PortInfo;
use crate::arena::Key;
use crate::router::ContextId;
use std::fmt;

/// Router-wide unique client handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub(crate) u64);

impl ClientId {
    /// Returns the raw handle value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// What to do when an opened client's name is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamePolicy {
    /// Fail with `NameInUse`.
    #[default]
    Exact,
    /// Append `-2`, `-3`, ... until the name is free.
    Unique,
}

/// The part a client plays in its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// An ordinary client.
    Plain,
    /// Stands for the nested context in its parent.
    Macro(ContextId),
    /// Bridge client whose outputs carry data into a nested context.
    Inlet,
    /// Bridge client whose inputs carry data out of a nested context.
    Outlet,
}

impl ClientRole {
    /// Returns true for the inlet and outlet clients of a bridge.
    pub fn is_bridge(self) -> bool {
        matches!(self, ClientRole::Inlet | ClientRole::Outlet)
    }
}

/// Public snapshot of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client handle.
    pub id: ClientId,
    /// Unique name within the context.
    pub name: String,
    /// Whether the client takes part in processing.
    pub active: bool,
    /// Role within the context.
    pub role: ClientRole,
    /// Factory that created the client, for persistence.
    pub factory: Option<String>,
    /// Opaque property blob.
    pub properties: Vec<u8>,
    /// Owned ports in registration order.
    pub ports: Vec<PortInfo>,
}

/// Control-plane client record.
pub(crate) struct Client {
    pub(crate) id: ClientId,
    pub(crate) name: String,
    pub(crate) ports: Vec<Key>,
    pub(crate) active: bool,
    pub(crate) has_handler: bool,
    pub(crate) role: ClientRole,
    pub(crate) properties: Vec<u8>,
    pub(crate) factory: Option<String>,
}

impl Client {
    pub(crate) fn new(id: ClientId, name: String, role: ClientRole) -> Self {
        Self {
            id,
            name,
            ports: Vec::new(),
            active: false,
            has_handler: false,
            role,
            properties: Vec::new(),
            factory: None,
        }
    }
}
