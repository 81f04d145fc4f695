//! Engine settings file.
//!
//! [`Settings`] is the TOML form of [`EngineConfig`]. Every key is optional;
//! missing keys take the engine defaults.
//!
//! ```toml
//! sample_rate = 48000.0
//! frames = 256
//! upsample = "linear"
//!
//! [names]
//! max_client = 64
//! max_port = 256
//! inlet = "inlet"
//! outlet = "outlet"
//!
//! [buffers]
//! channel_capacity = 4096
//! reclaim_capacity = 4096
//! midi_bytes = 16384
//! ```

use crate::error::ConfigError;
use nido_core::{EngineConfig, UpsampleMode};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest change channel that still fits a context push.
pub const MIN_CHANNEL_CAPACITY: usize = 16;

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root sample rate in Hz.
    pub sample_rate: f32,
    /// Root frames per cycle.
    pub frames: usize,
    /// Upsampling used by interface bridges.
    pub upsample: UpsampleMode,
    /// Naming limits and bridge client names.
    pub names: NameSettings,
    /// Queue and buffer sizes.
    pub buffers: BufferSettings,
}

/// Naming limits and bridge client names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameSettings {
    /// Maximum client name length in bytes.
    pub max_client: usize,
    /// Maximum full port name length in bytes.
    pub max_port: usize,
    /// Inlet bridge client name.
    pub inlet: String,
    /// Outlet bridge client name.
    pub outlet: String,
}

/// Queue and buffer sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Change channel capacity per context.
    pub channel_capacity: usize,
    /// Reclaim queue capacity per context.
    pub reclaim_capacity: usize,
    /// MIDI payload bytes per port buffer.
    pub midi_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl Default for NameSettings {
    fn default() -> Self {
        Settings::default().names
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Settings::default().buffers
    }
}

impl From<&EngineConfig> for Settings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            frames: config.frames,
            upsample: config.upsample,
            names: NameSettings {
                max_client: config.max_client_name,
                max_port: config.max_port_name,
                inlet: config.inlet_name.clone(),
                outlet: config.outlet_name.clone(),
            },
            buffers: BufferSettings {
                channel_capacity: config.channel_capacity,
                reclaim_capacity: config.reclaim_capacity,
                midi_bytes: config.midi_buffer_bytes,
            },
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        Self::from_toml(&content)
    }

    /// Load settings from a file, falling back to defaults when it does not
    /// exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse settings from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(toml_str)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize settings to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save settings to a TOML file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
    }

    /// Checks every value is usable by the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::InvalidSetting {
                key,
                reason: reason.into(),
            }
        }

        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(invalid("sample_rate", "must be a positive number"));
        }
        if self.frames == 0 {
            return Err(invalid("frames", "must be at least 1"));
        }
        if self.names.max_client == 0 {
            return Err(invalid("names.max_client", "must be at least 1"));
        }
        if self.names.max_port <= self.names.max_client {
            return Err(invalid(
                "names.max_port",
                "must exceed names.max_client to fit 'client:port'",
            ));
        }
        for (key, name) in [("names.inlet", &self.names.inlet), ("names.outlet", &self.names.outlet)] {
            if name.is_empty() || name.contains(':') {
                return Err(invalid(key, "must be non-empty and contain no ':'"));
            }
        }
        if self.names.inlet == self.names.outlet {
            return Err(invalid("names.outlet", "must differ from names.inlet"));
        }
        if self.buffers.channel_capacity < MIN_CHANNEL_CAPACITY {
            return Err(invalid(
                "buffers.channel_capacity",
                format!("must be at least {MIN_CHANNEL_CAPACITY}"),
            ));
        }
        if self.buffers.reclaim_capacity == 0 {
            return Err(invalid("buffers.reclaim_capacity", "must be at least 1"));
        }
        Ok(())
    }

    /// Engine configuration described by these settings.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            sample_rate: self.sample_rate,
            frames: self.frames,
            max_client_name: self.names.max_client,
            max_port_name: self.names.max_port,
            channel_capacity: self.buffers.channel_capacity,
            reclaim_capacity: self.buffers.reclaim_capacity,
            midi_buffer_bytes: self.buffers.midi_bytes,
            upsample: self.upsample,
            inlet_name: self.names.inlet.clone(),
            outlet_name: self.names.outlet.clone(),
        }
    }
}
