//! Real-time side of a context.
//!
//! An [`RtEngine`] owns the receiving end of a context's change channel, its
//! twin mirror and its scheduler. The root engine is handed to the host, which
//! calls [`RtEngine::process`] once per cycle. Nested engines live inside the
//! process handler of their macro client and are driven from the parent's
//! cycle.

use crate::buffer::DESCRIPTOR_SIZE;
use crate::channel::ChangeReceiver;
use crate::error::CycleError;
use crate::scheduler::Scheduler;
use crate::twin::{TwinMirror, TwinSnapshot};

/// The process callback a host registers for the root context.
pub struct RtEngine {
    receiver: ChangeReceiver,
    pub(crate) twin: TwinMirror,
    pub(crate) scheduler: Scheduler,
    midi_events_per_port: usize,
}

impl RtEngine {
    pub(crate) fn new(receiver: ChangeReceiver, frames: usize, midi_bytes: usize) -> Self {
        Self {
            receiver,
            twin: TwinMirror::new(frames),
            scheduler: Scheduler::new(),
            midi_events_per_port: midi_bytes / DESCRIPTOR_SIZE,
        }
    }

    /// Runs one cycle of `frames` frames.
    ///
    /// Applies pending topology changes first, so every change submitted
    /// before this call is in effect for this cycle.
    pub fn process(&mut self, frames: usize) -> Result<(), CycleError> {
        self.begin_cycle(frames);
        self.scheduler.run(&mut self.twin, frames)
    }

    /// Drains the change channel and follows frame-count changes.
    pub(crate) fn begin_cycle(&mut self, frames: usize) {
        let twin = &mut self.twin;
        self.receiver.drain(|change, reclaim| twin.apply(change, reclaim));
        self.twin.set_frames(frames);
        self.scheduler.fit(&self.twin, self.midi_events_per_port);
    }

    /// Marks the engine as driven (or not) by a host thread.
    ///
    /// Control-plane calls only wait for the real-time thread while the engine
    /// is live. A host must set this before its first cycle and clear it when
    /// it stops calling [`process`](Self::process).
    pub fn set_live(&self, live: bool) {
        self.receiver.rendezvous().set_attached(live);
    }

    /// Returns true while the engine is marked live.
    pub fn is_live(&self) -> bool {
        self.receiver.rendezvous().is_live()
    }

    /// Frame count of the last cycle.
    pub fn frames(&self) -> usize {
        self.twin.frames()
    }

    /// Copies the twin topology out for inspection. Allocates; not for the
    /// real-time thread.
    pub fn snapshot(&self) -> TwinSnapshot {
        self.twin.snapshot()
    }

    /// MIDI events dropped in the last cycle, summed over every port.
    pub fn lost_midi_events(&self) -> usize {
        self.twin.lost_midi_events()
    }
}
