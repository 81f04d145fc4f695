//! Process callbacks and the per-cycle buffer accessor.
//!
//! A client's [`ProcessHandler`] runs once per cycle on the real-time thread.
//! It receives a [`ProcessScope`] that resolves the client's own ports to
//! their buffers. Inputs are already merged and outputs already cleared when
//! the handler runs.
//!
//! Closures of the form `FnMut(&mut ProcessScope<'_>) -> Result<(), ProcessError>`
//! are handlers too:
//!
//! ```rust,ignore
//! router.set_process_handler(client, move |scope: &mut ProcessScope<'_>| -> Result<(), ProcessError> {
//!     let frames = scope.frames();
//!     if let Some(out) = scope.audio_mut(out_port) {
//!         out[..frames].fill(0.5);
//!     }
//!     Ok(())
//! })?;
//! ```

use crate::arena::Key;
use crate::buffer::{MidiBuffer, PortBuffer};
use crate::error::ProcessError;
use crate::graph::{ClientId, PortDirection, PortId};
use crate::twin::TwinPort;

/// Per-client process callback.
///
/// Handlers are moved to the real-time thread when installed and come back to
/// the control thread when released, so they must be `Send`. `process` must
/// not block or allocate.
pub trait ProcessHandler: Send {
    /// Processes one cycle. An error aborts the rest of the cycle.
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Result<(), ProcessError>;

    /// Called on the real-time thread when the client becomes active.
    fn activated(&mut self) {}

    /// Called on the real-time thread when the client is deactivated.
    fn deactivated(&mut self) {}
}

impl<F> ProcessHandler for F
where
    F: FnMut(&mut ProcessScope<'_>) -> Result<(), ProcessError> + Send,
{
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Result<(), ProcessError> {
        self(scope)
    }
}

/// Buffer access for one client during one cycle.
pub struct ProcessScope<'a> {
    frames: usize,
    client: ClientId,
    ports: &'a [usize],
    twin_ports: &'a [Option<TwinPort>],
    buffers: &'a mut [Option<Box<PortBuffer>>],
}

impl<'a> ProcessScope<'a> {
    pub(crate) fn new(
        frames: usize,
        client: ClientId,
        ports: &'a [usize],
        twin_ports: &'a [Option<TwinPort>],
        buffers: &'a mut [Option<Box<PortBuffer>>],
    ) -> Self {
        Self {
            frames,
            client,
            ports,
            twin_ports,
            buffers,
        }
    }

    /// Frames in this cycle.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// The client being processed.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// The client's ports with their directions.
    pub fn ports(&self) -> impl Iterator<Item = (PortId, PortDirection)> + '_ {
        self.ports.iter().filter_map(|&i| {
            self.twin_ports
                .get(i)
                .and_then(Option::as_ref)
                .map(|p| (p.id, p.direction))
        })
    }

    fn index_of(&self, id: PortId) -> Option<usize> {
        self.ports.iter().copied().find(|&i| {
            self.twin_ports
                .get(i)
                .and_then(Option::as_ref)
                .is_some_and(|p| p.id == id)
        })
    }

    fn index_of_key(&self, key: Key) -> Option<usize> {
        let i = key.index();
        let owned = self.ports.contains(&i)
            && self
                .twin_ports
                .get(i)
                .and_then(Option::as_ref)
                .is_some_and(|p| p.key == key);
        owned.then_some(i)
    }

    /// Buffer of one of the client's ports.
    pub fn buffer(&self, id: PortId) -> Option<&PortBuffer> {
        let i = self.index_of(id)?;
        self.buffers.get(i)?.as_deref()
    }

    /// Mutable buffer of one of the client's ports.
    pub fn buffer_mut(&mut self, id: PortId) -> Option<&mut PortBuffer> {
        let i = self.index_of(id)?;
        self.buffers.get_mut(i)?.as_deref_mut()
    }

    /// An input and an output buffer at once, for in-place style processing.
    ///
    /// Returns `None` if either port is missing or both name the same port.
    pub fn buffer_pair(
        &mut self,
        input: PortId,
        output: PortId,
    ) -> Option<(&PortBuffer, &mut PortBuffer)> {
        let (i, o) = (self.index_of(input)?, self.index_of(output)?);
        if i == o {
            return None;
        }
        let (src, dst) = if i < o {
            let (lo, hi) = self.buffers.split_at_mut(o);
            (&lo[i], &mut hi[0])
        } else {
            let (lo, hi) = self.buffers.split_at_mut(i);
            (&hi[0], &mut lo[o])
        };
        Some((src.as_deref()?, dst.as_deref_mut()?))
    }

    /// Audio samples of an input and an output port at once.
    pub fn audio_pair(&mut self, input: PortId, output: PortId) -> Option<(&[f32], &mut [f32])> {
        let (src, dst) = self.buffer_pair(input, output)?;
        Some((src.as_audio()?.as_slice(), dst.as_audio_mut()?.as_mut_slice()))
    }

    /// Events of a MIDI input and a MIDI output port at once.
    pub fn midi_pair(
        &mut self,
        input: PortId,
        output: PortId,
    ) -> Option<(&MidiBuffer, &mut MidiBuffer)> {
        let (src, dst) = self.buffer_pair(input, output)?;
        Some((src.as_midi()?, dst.as_midi_mut()?))
    }

    pub(crate) fn buffer_by_key(&self, key: Key) -> Option<&PortBuffer> {
        let i = self.index_of_key(key)?;
        self.buffers.get(i)?.as_deref()
    }

    pub(crate) fn buffer_by_key_mut(&mut self, key: Key) -> Option<&mut PortBuffer> {
        let i = self.index_of_key(key)?;
        self.buffers.get_mut(i)?.as_deref_mut()
    }

    /// Samples of an audio port.
    pub fn audio(&self, id: PortId) -> Option<&[f32]> {
        self.buffer(id)?.as_audio().map(|a| a.as_slice())
    }

    /// Mutable samples of an audio port.
    pub fn audio_mut(&mut self, id: PortId) -> Option<&mut [f32]> {
        self.buffer_mut(id)?.as_audio_mut().map(|a| a.as_mut_slice())
    }

    /// Events of a MIDI port.
    pub fn midi(&self, id: PortId) -> Option<&MidiBuffer> {
        self.buffer(id)?.as_midi()
    }

    /// Mutable events of a MIDI port.
    pub fn midi_mut(&mut self, id: PortId) -> Option<&mut MidiBuffer> {
        self.buffer_mut(id)?.as_midi_mut()
    }
}
