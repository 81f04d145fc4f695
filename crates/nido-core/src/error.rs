//! Error types for the routing engine.
//!
//! Control-plane operations return [`EngineError`]. A failed processing cycle
//! reports [`CycleError`]. Both are plain data so the real-time thread can
//! construct them without allocating.

use crate::graph::{ClientId, PortDirection, PortType};
use crate::router::ContextId;
use thiserror::Error;

/// Errors returned by control-plane operations.
///
/// Every operation that returns an error leaves the graph, the twin mirror and
/// the change channel exactly as they were before the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A client or port name exceeds the configured limit.
    #[error("name '{name}' is longer than {max} bytes")]
    NameTooLong {
        /// The rejected name.
        name: String,
        /// Configured maximum in bytes.
        max: usize,
    },

    /// The name is already taken in this scope.
    #[error("name '{0}' is already in use")]
    NameInUse(String),

    /// The name is empty or contains a reserved character.
    #[error("invalid name '{0}'")]
    InvalidName(String),

    /// No client with this handle or name exists.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// No port with this handle or name exists.
    #[error("port not found: {0}")]
    PortNotFound(String),

    /// No context with this id exists.
    #[error("context {0} not found")]
    ContextNotFound(ContextId),

    /// A connection endpoint has the wrong direction.
    #[error("direction mismatch: expected {expected:?} port, got '{port}'")]
    DirectionMismatch {
        /// The offending port.
        port: String,
        /// Direction the operation required.
        expected: PortDirection,
    },

    /// Connected ports carry different data types.
    #[error("type mismatch: {output:?} output cannot feed {input:?} input")]
    TypeMismatch {
        /// Type of the output port.
        output: PortType,
        /// Type of the input port.
        input: PortType,
    },

    /// The two ports are already connected.
    #[error("'{0}' and '{1}' are already connected")]
    AlreadyConnected(String, String),

    /// The two ports are not connected.
    #[error("'{0}' and '{1}' are not connected")]
    NotConnected(String, String),

    /// The connection would create a cycle between clients.
    #[error("connecting '{0}' to '{1}' would create a cycle")]
    CycleDetected(String, String),

    /// The operation requires the client to be inactive.
    #[error("client '{0}' is active")]
    ClientActive(String),

    /// The root context cannot be popped.
    #[error("cannot pop the last context")]
    LastContext,

    /// The context is on the stack and cannot be deleted.
    #[error("context {0} is in use")]
    ContextInUse(ContextId),

    /// The operation requires a nested context.
    #[error("context {0} is not nested")]
    NotNested(ContextId),

    /// The context is not a child of the current context.
    #[error("context {0} is not a child of the current context")]
    NotChild(ContextId),

    /// Oversampling factors run from 1 to `MAX_OVERSAMPLING`, and the nested
    /// frame count may not exceed `MAX_CONTEXT_FRAMES`.
    #[error("invalid oversampling factor {0}")]
    InvalidOversampling(u32),

    /// The client or port is owned by an interface bridge.
    #[error("'{0}' is managed by an interface bridge")]
    BridgeManaged(String),

    /// The port query pattern is not a valid regular expression.
    #[error("invalid port pattern: {0}")]
    InvalidPattern(String),
}

/// Convenience result alias for control-plane operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure reported by a process callback.
///
/// The wrapped code is the callback's non-zero return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("process callback failed with code {0}")]
pub struct ProcessError(pub i32);

/// Errors returned by a processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CycleError {
    /// A client's callback failed; the rest of the cycle was skipped.
    #[error("client {client} failed with code {code}")]
    ClientFailed {
        /// The client whose callback failed.
        client: ClientId,
        /// The callback's failure code.
        code: i32,
    },
}
