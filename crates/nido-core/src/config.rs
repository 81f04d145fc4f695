//! Engine-wide configuration.

/// Largest rate factor a single nested context may run at.
pub const MAX_OVERSAMPLING: u32 = 64;

/// Largest frame count of any context, nested factors multiplied in.
pub const MAX_CONTEXT_FRAMES: usize = 1 << 20;

/// How a bridge raises a parent-rate signal to the nested context's rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum UpsampleMode {
    /// Repeat each sample `factor` times.
    #[default]
    Hold,
    /// Ramp linearly from the previous sample to the current one.
    Linear,
}

/// Limits and defaults shared by every context of a router.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Root sample rate in Hz.
    pub sample_rate: f32,
    /// Root frames per cycle.
    pub frames: usize,
    /// Maximum client name length in bytes.
    pub max_client_name: usize,
    /// Maximum short port name length in bytes.
    pub max_port_name: usize,
    /// Capacity of each context's change channel, in events.
    pub channel_capacity: usize,
    /// Capacity of each context's reclaim queue, in items. Raised to
    /// `channel_capacity` if smaller.
    pub reclaim_capacity: usize,
    /// Bytes available to each MIDI port buffer, header excluded.
    pub midi_buffer_bytes: usize,
    /// Upsampling used by interface bridges.
    pub upsample: UpsampleMode,
    /// Name of the bridge client that feeds a nested context.
    pub inlet_name: String,
    /// Name of the bridge client that drains a nested context.
    pub outlet_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            frames: 256,
            max_client_name: 64,
            max_port_name: 256,
            channel_capacity: 4096,
            reclaim_capacity: 4096,
            midi_buffer_bytes: 16384,
            upsample: UpsampleMode::Hold,
            inlet_name: "inlet".to_owned(),
            outlet_name: "outlet".to_owned(),
        }
    }
}
