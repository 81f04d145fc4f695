//! Settings and patch persistence for nido routing contexts.
//!
//! # Features
//!
//! - **Settings**: the engine configuration as a TOML file with defaults for
//!   every missing key and validation
//! - **Patches**: save a context subtree (clients, factory state, nested
//!   contexts, connections) to a versioned JSON stream and load it back
//! - **Paths**: platform-specific settings and patch directories
//!
//! # Example
//!
//! ```rust,no_run
//! use nido_config::{Settings, paths, persist};
//! use nido_core::ContextRouter;
//! use nido_registry::ClientRegistry;
//!
//! let settings = Settings::load_or_default(paths::settings_path()).unwrap();
//! let (mut router, mut engine) = ContextRouter::new(settings.engine_config());
//! let registry = ClientRegistry::with_builtins();
//!
//! let patch = paths::user_patches_dir().join("live.json");
//! let report = persist::load_from_path(&mut router, &registry, &patch).unwrap();
//! for name in &report.skipped_clients {
//!     eprintln!("skipped {name}");
//! }
//! router.flush();
//! engine.process(settings.frames).unwrap();
//! ```

mod error;

/// Platform-specific paths for settings and patches.
pub mod paths;

/// Patch documents and the save/load codec.
pub mod persist;

/// Engine settings file.
pub mod settings;

pub use error::ConfigError;
pub use paths::{
    ensure_user_config_dir, ensure_user_patches_dir, list_user_patches, settings_path,
    user_config_dir, user_patches_dir,
};
pub use persist::{LoadReport, PATCH_VERSION, PatchDocument, load, load_from_path, save, save_to_path};
pub use settings::Settings;
