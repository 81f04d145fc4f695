//! Client factory registry for nido routing contexts.
//!
//! A factory knows how to build one kind of client (its ports and process
//! handler) inside a [`ContextRouter`], and how to save and restore that
//! client's opaque state. Patches record the factory id of every client they
//! contain so loading can rebuild it.
//!
//! The registry is an application-owned value: build one at startup, register
//! your own factories, and pass it to save/load.
//!
//! # Example
//!
//! ```rust
//! use nido_core::{ContextRouter, EngineConfig};
//! use nido_registry::ClientRegistry;
//!
//! let registry = ClientRegistry::with_builtins();
//! for factory in registry.all_factories() {
//!     println!("{}: {}", factory.id, factory.description);
//! }
//!
//! let (mut router, _engine) = ContextRouter::new(EngineConfig::default());
//! let gain = registry.create("gain", &mut router, "vol").unwrap();
//! registry.levels().set(gain, 0.5);
//! assert_eq!(router.client_info(gain).unwrap().factory.as_deref(), Some("gain"));
//! ```

pub mod builtin;

pub use builtin::Levels;

use nido_core::{ClientId, ContextRouter, EngineError};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by factories and the registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FactoryError {
    /// No factory is registered under this id.
    #[error("unknown factory '{0}'")]
    Unknown(String),

    /// Saved state could not be decoded.
    #[error("invalid state for factory '{factory}': {reason}")]
    InvalidState {
        /// Factory id.
        factory: String,
        /// What was wrong with the bytes.
        reason: String,
    },

    /// Building or updating the client failed in the engine.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Builds and persists one kind of client.
pub trait ClientFactory: Send + Sync {
    /// Opens a client named `name` in the router's current context, with its
    /// ports and process handler in place. The client is left inactive.
    fn create(&self, router: &mut ContextRouter, name: &str) -> Result<ClientId, FactoryError>;

    /// Serializes the client's state.
    fn save_state(&self, _router: &ContextRouter, _client: ClientId) -> Result<Vec<u8>, FactoryError> {
        Ok(Vec::new())
    }

    /// Restores state produced by [`save_state`](Self::save_state).
    fn load_state(
        &self,
        _router: &mut ContextRouter,
        _client: ClientId,
        _state: &[u8],
    ) -> Result<(), FactoryError> {
        Ok(())
    }
}

/// Describes a factory in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryDescriptor {
    /// Unique identifier stored in patches (lowercase, no spaces).
    pub id: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// Brief description of the client.
    pub description: &'static str,
}

struct RegistryEntry {
    descriptor: FactoryDescriptor,
    factory: Box<dyn ClientFactory>,
}

/// Registry of client factories keyed by id.
pub struct ClientRegistry {
    entries: Vec<RegistryEntry>,
    levels: Arc<Levels>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            levels: Arc::new(Levels::default()),
        }
    }

    /// Creates a registry with the built-in factories registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    /// Level table shared by the built-in `gain` and `constant` factories.
    pub fn levels(&self) -> &Arc<Levels> {
        &self.levels
    }

    /// Registers a factory, replacing any factory with the same id.
    pub fn register(&mut self, descriptor: FactoryDescriptor, factory: impl ClientFactory + 'static) {
        let entry = RegistryEntry {
            descriptor,
            factory: Box::new(factory),
        };
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.descriptor.id == entry.descriptor.id)
        {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    /// Returns descriptors for all registered factories.
    pub fn all_factories(&self) -> Vec<&FactoryDescriptor> {
        self.entries.iter().map(|e| &e.descriptor).collect()
    }

    /// Get a descriptor by factory id.
    pub fn get(&self, id: &str) -> Option<&FactoryDescriptor> {
        self.entry(id).map(|e| &e.descriptor)
    }

    /// Returns true if a factory is registered under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.entry(id).is_some()
    }

    fn entry(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.descriptor.id == id)
    }

    fn factory(&self, id: &str) -> Result<&dyn ClientFactory, FactoryError> {
        self.entry(id)
            .map(|e| e.factory.as_ref())
            .ok_or_else(|| FactoryError::Unknown(id.to_owned()))
    }

    /// Creates a client with factory `id` and tags it with that id.
    pub fn create(
        &self,
        id: &str,
        router: &mut ContextRouter,
        name: &str,
    ) -> Result<ClientId, FactoryError> {
        let client = self.factory(id)?.create(router, name)?;
        router.set_client_factory(client, Some(id.to_owned()))?;
        Ok(client)
    }

    /// Saves a client's state with factory `id`.
    pub fn save_state(
        &self,
        id: &str,
        router: &ContextRouter,
        client: ClientId,
    ) -> Result<Vec<u8>, FactoryError> {
        self.factory(id)?.save_state(router, client)
    }

    /// Restores a client's state with factory `id`.
    pub fn load_state(
        &self,
        id: &str,
        router: &mut ContextRouter,
        client: ClientId,
        state: &[u8],
    ) -> Result<(), FactoryError> {
        self.factory(id)?.load_state(router, client, state)
    }

    /// Returns the number of registered factories.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no factories are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nido_core::{EngineConfig, NamePolicy};

    struct Bare;

    impl ClientFactory for Bare {
        fn create(&self, router: &mut ContextRouter, name: &str) -> Result<ClientId, FactoryError> {
            Ok(router.open_client(name, NamePolicy::Exact)?)
        }
    }

    fn bare() -> FactoryDescriptor {
        FactoryDescriptor {
            id: "bare",
            name: "Bare",
            description: "Client without ports",
        }
    }

    #[test]
    fn test_registry_creation() {
        let registry = ClientRegistry::with_builtins();
        assert_eq!(registry.len(), 3);
        assert!(ClientRegistry::new().is_empty());
    }

    #[test]
    fn test_get_factory() {
        let registry = ClientRegistry::with_builtins();
        assert_eq!(registry.get("gain").map(|d| d.name), Some("Gain"));
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn test_register_replaces_same_id() {
        let mut registry = ClientRegistry::new();
        registry.register(bare(), Bare);
        registry.register(
            FactoryDescriptor {
                description: "Replacement",
                ..bare()
            },
            Bare,
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("bare").unwrap().description, "Replacement");
    }

    #[test]
    fn test_create_tags_client() {
        let mut registry = ClientRegistry::new();
        registry.register(bare(), Bare);
        let (mut router, _engine) = ContextRouter::new(EngineConfig::default());
        let client = registry.create("bare", &mut router, "x").unwrap();
        assert_eq!(router.client_info(client).unwrap().factory.as_deref(), Some("bare"));
        // default state hooks are no-ops
        assert!(registry.save_state("bare", &router, client).unwrap().is_empty());
        registry.load_state("bare", &mut router, client, &[1, 2]).unwrap();
    }

    #[test]
    fn test_unknown_factory() {
        let registry = ClientRegistry::new();
        let (mut router, _engine) = ContextRouter::new(EngineConfig::default());
        assert!(matches!(
            registry.create("nope", &mut router, "x"),
            Err(FactoryError::Unknown(_))
        ));
        assert!(router.client_by_name("x").is_none());
    }

    #[test]
    fn test_engine_errors_pass_through() {
        let mut registry = ClientRegistry::new();
        registry.register(bare(), Bare);
        let (mut router, _engine) = ContextRouter::new(EngineConfig::default());
        registry.create("bare", &mut router, "x").unwrap();
        assert!(matches!(
            registry.create("bare", &mut router, "x"),
            Err(FactoryError::Engine(EngineError::NameInUse(_)))
        ));
    }
}
