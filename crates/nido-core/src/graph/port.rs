//! Port identity and metadata.

use crate::arena::Key;
use std::fmt;

/// Router-wide unique port handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub(crate) u64);

impl PortId {
    /// Returns the raw handle value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Data carried by a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PortType {
    /// 32-bit float samples.
    Audio,
    /// Timestamped MIDI events.
    Midi,
}

/// Flow direction, seen from the owning client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PortDirection {
    /// The client reads from the port.
    Input,
    /// The client writes to the port.
    Output,
}

impl PortDirection {
    /// Returns the other direction.
    pub fn opposite(self) -> Self {
        match self {
            PortDirection::Input => PortDirection::Output,
            PortDirection::Output => PortDirection::Input,
        }
    }
}

/// Public snapshot of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port handle.
    pub id: PortId,
    /// Owning client handle.
    pub client: super::ClientId,
    /// Name within the client.
    pub short_name: String,
    /// `client:short` name.
    pub full_name: String,
    /// Data type.
    pub port_type: PortType,
    /// Direction.
    pub direction: PortDirection,
    /// Connected peers in connection order.
    pub connections: Vec<PortId>,
}

/// Control-plane port record.
pub(crate) struct Port {
    pub(crate) id: PortId,
    pub(crate) client: Key,
    pub(crate) short_name: String,
    pub(crate) port_type: PortType,
    pub(crate) direction: PortDirection,
    /// Peers in connection-insertion order.
    pub(crate) connections: Vec<Key>,
}
