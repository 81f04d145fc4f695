//! Per-port audio and MIDI storage.
//!
//! Every port owns one [`PortBuffer`]. Audio buffers are flat sample arrays
//! sized to the current frame count; MIDI buffers use the fixed layout in
//! [`midi`]. Inputs are filled by merge-on-read: the scheduler sums (audio) or
//! time-merges (MIDI) every connected output into the input before its client
//! runs.

pub mod midi;

pub use midi::{DESCRIPTOR_SIZE, HEADER_SIZE, MidiBuffer, MidiEvent, MidiMerger, MidiOverflow};

use crate::graph::PortType;

/// A mono audio buffer sized to the cycle's frame count.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
}

impl AudioBuffer {
    /// Creates a zeroed buffer of `frames` samples.
    pub fn new(frames: usize) -> Self {
        Self {
            samples: vec![0.0; frames],
        }
    }

    /// Fills the buffer with zeros.
    pub fn clear(&mut self) {
        self.samples.fill(0.0);
    }

    /// Resizes to `frames` samples, zeroing new samples.
    ///
    /// Allocates only when growing past the previous capacity.
    pub fn resize(&mut self, frames: usize) {
        self.samples.resize(frames, 0.0);
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Adds another buffer's contents sample-by-sample.
    pub fn accumulate_from(&mut self, other: &AudioBuffer) {
        for (dst, src) in self.samples.iter_mut().zip(other.samples.iter()) {
            *dst += *src;
        }
    }

    /// Copies another buffer's contents, up to the shorter length.
    pub fn copy_from(&mut self, other: &AudioBuffer) {
        let n = self.samples.len().min(other.samples.len());
        self.samples[..n].copy_from_slice(&other.samples[..n]);
    }

    /// Returns the samples.
    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    /// Returns the samples mutably.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.samples
    }
}

/// Storage behind one port.
#[derive(Debug, Clone, PartialEq)]
pub enum PortBuffer {
    /// Audio samples.
    Audio(AudioBuffer),
    /// MIDI events.
    Midi(MidiBuffer),
}

impl PortBuffer {
    /// Allocates the buffer for a port of `port_type`.
    pub fn new(port_type: PortType, frames: usize, midi_bytes: usize) -> Self {
        match port_type {
            PortType::Audio => PortBuffer::Audio(AudioBuffer::new(frames)),
            PortType::Midi => PortBuffer::Midi(MidiBuffer::new(midi_bytes)),
        }
    }

    /// Returns the data type carried by this buffer.
    pub fn port_type(&self) -> PortType {
        match self {
            PortBuffer::Audio(_) => PortType::Audio,
            PortBuffer::Midi(_) => PortType::Midi,
        }
    }

    /// Follows a frame-count change. MIDI buffers are unaffected.
    pub fn set_frames(&mut self, frames: usize) {
        if let PortBuffer::Audio(audio) = self {
            audio.resize(frames);
        }
    }

    /// Zeroes audio or clears MIDI events.
    pub fn reset(&mut self) {
        match self {
            PortBuffer::Audio(audio) => audio.clear(),
            PortBuffer::Midi(midi) => midi.clear(),
        }
    }

    /// Returns the audio buffer, if this is an audio port.
    pub fn as_audio(&self) -> Option<&AudioBuffer> {
        match self {
            PortBuffer::Audio(audio) => Some(audio),
            PortBuffer::Midi(_) => None,
        }
    }

    /// Returns the audio buffer mutably, if this is an audio port.
    pub fn as_audio_mut(&mut self) -> Option<&mut AudioBuffer> {
        match self {
            PortBuffer::Audio(audio) => Some(audio),
            PortBuffer::Midi(_) => None,
        }
    }

    /// Returns the MIDI buffer, if this is a MIDI port.
    pub fn as_midi(&self) -> Option<&MidiBuffer> {
        match self {
            PortBuffer::Midi(midi) => Some(midi),
            PortBuffer::Audio(_) => None,
        }
    }

    /// Returns the MIDI buffer mutably, if this is a MIDI port.
    pub fn as_midi_mut(&mut self) -> Option<&mut MidiBuffer> {
        match self {
            PortBuffer::Midi(midi) => Some(midi),
            PortBuffer::Audio(_) => None,
        }
    }
}
