//! MIDI port buffer with a fixed binary layout.
//!
//! ```text
//! +----------------------------------------------------------------+
//! | capacity | payload_used | event_count | lost_count |  header   |
//! +----------------------------------------------------------------+
//! | {time, size, offset} {time, size, offset} ...  -> descriptors  |
//! |                      ... free ...                              |
//! |            <- payload of event n-1 ... payload of event 0      |
//! +----------------------------------------------------------------+
//! ```
//!
//! Every header and descriptor field is a native-endian `usize`. Descriptors
//! grow from the head, payload grows from the tail, and `capacity` counts the
//! bytes between the end of the header and the end of the buffer. `offset` is
//! measured from the start of the buffer.

use thiserror::Error;

const WORD: usize = std::mem::size_of::<usize>();

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 4 * WORD;

/// Size of one event descriptor in bytes.
pub const DESCRIPTOR_SIZE: usize = 3 * WORD;

const CAPACITY: usize = 0;
const PAYLOAD_USED: usize = WORD;
const EVENT_COUNT: usize = 2 * WORD;
const LOST_COUNT: usize = 3 * WORD;

/// An event could not be written because the buffer is full.
///
/// [`MidiBuffer::write`] has already counted it as lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("MIDI buffer full: {requested} bytes requested, {available} available")]
pub struct MidiOverflow {
    /// Payload bytes the event needed.
    pub requested: usize,
    /// Largest payload that would have fit.
    pub available: usize,
}

/// A borrowed MIDI event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent<'a> {
    /// Frame offset within the cycle.
    pub time: u32,
    /// Raw MIDI bytes.
    pub bytes: &'a [u8],
}

/// A MIDI port buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct MidiBuffer {
    data: Vec<u8>,
}

impl std::fmt::Debug for MidiBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiBuffer")
            .field("capacity", &self.capacity())
            .field("event_count", &self.event_count())
            .field("payload_used", &self.payload_used())
            .field("lost_count", &self.lost_count())
            .finish()
    }
}

impl MidiBuffer {
    /// Creates an empty buffer with `capacity` bytes for descriptors and payload.
    pub fn new(capacity: usize) -> Self {
        let mut buffer = Self {
            data: vec![0; HEADER_SIZE + capacity],
        };
        buffer.write_word(CAPACITY, capacity);
        buffer
    }

    fn read_word(&self, at: usize) -> usize {
        let mut word = [0u8; WORD];
        word.copy_from_slice(&self.data[at..at + WORD]);
        usize::from_ne_bytes(word)
    }

    fn write_word(&mut self, at: usize, value: usize) {
        self.data[at..at + WORD].copy_from_slice(&value.to_ne_bytes());
    }

    fn descriptor_at(index: usize) -> usize {
        HEADER_SIZE + index * DESCRIPTOR_SIZE
    }

    /// Bytes available to descriptors and payload.
    pub fn capacity(&self) -> usize {
        self.read_word(CAPACITY)
    }

    /// Payload bytes in use.
    pub fn payload_used(&self) -> usize {
        self.read_word(PAYLOAD_USED)
    }

    /// Number of stored events.
    pub fn event_count(&self) -> usize {
        self.read_word(EVENT_COUNT)
    }

    /// Number of events dropped since the last [`clear`](Self::clear).
    pub fn lost_count(&self) -> usize {
        self.read_word(LOST_COUNT)
    }

    /// Descriptor plus payload bytes in use.
    pub fn bytes_used(&self) -> usize {
        self.event_count() * DESCRIPTOR_SIZE + self.payload_used()
    }

    /// Largest payload the next event may carry.
    pub fn max_event_size(&self) -> usize {
        (self.capacity() - self.bytes_used()).saturating_sub(DESCRIPTOR_SIZE)
    }

    /// Removes every event and resets the lost counter.
    pub fn clear(&mut self) {
        self.write_word(PAYLOAD_USED, 0);
        self.write_word(EVENT_COUNT, 0);
        self.write_word(LOST_COUNT, 0);
    }

    /// Adds `count` to the lost-event counter.
    pub fn record_lost(&mut self, count: usize) {
        let lost = self.lost_count() + count;
        self.write_word(LOST_COUNT, lost);
    }

    /// Appends an event of `size` payload bytes and returns its payload.
    ///
    /// Returns `None` without touching the buffer when the remaining capacity
    /// is smaller than one descriptor plus `size`. The caller decides whether
    /// to record the drop.
    pub fn reserve(&mut self, time: u32, size: usize) -> Option<&mut [u8]> {
        let remaining = self.capacity() - self.bytes_used();
        if remaining < DESCRIPTOR_SIZE + size {
            return None;
        }
        let count = self.event_count();
        let used = self.payload_used() + size;
        let offset = self.data.len() - used;

        let at = Self::descriptor_at(count);
        self.write_word(at, time as usize);
        self.write_word(at + WORD, size);
        self.write_word(at + 2 * WORD, offset);
        self.write_word(PAYLOAD_USED, used);
        self.write_word(EVENT_COUNT, count + 1);
        Some(&mut self.data[offset..offset + size])
    }

    /// Appends a copy of `bytes`, counting the event as lost if it does not fit.
    pub fn write(&mut self, time: u32, bytes: &[u8]) -> Result<(), MidiOverflow> {
        let available = self.max_event_size();
        if let Some(payload) = self.reserve(time, bytes.len()) {
            payload.copy_from_slice(bytes);
            Ok(())
        } else {
            self.record_lost(1);
            Err(MidiOverflow {
                requested: bytes.len(),
                available,
            })
        }
    }

    /// Returns the event at `index`.
    pub fn get(&self, index: usize) -> Option<MidiEvent<'_>> {
        if index >= self.event_count() {
            return None;
        }
        let at = Self::descriptor_at(index);
        let time = self.read_word(at) as u32;
        let size = self.read_word(at + WORD);
        let offset = self.read_word(at + 2 * WORD);
        Some(MidiEvent {
            time,
            bytes: &self.data[offset..offset + size],
        })
    }

    /// Returns the time offset of the event at `index`.
    pub fn event_time(&self, index: usize) -> Option<u32> {
        if index >= self.event_count() {
            return None;
        }
        Some(self.read_word(Self::descriptor_at(index)) as u32)
    }

    /// Iterates events in storage order.
    pub fn iter(&self) -> impl Iterator<Item = MidiEvent<'_>> {
        (0..self.event_count()).filter_map(|i| self.get(i))
    }

    /// Raw layout, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Clone, Copy)]
struct MergeEntry {
    time: u32,
    source: usize,
    index: usize,
}

/// Merges the events of several MIDI buffers into one, ordered by time.
///
/// Ties are broken by source rank (connection order) and then by each
/// source's own event order. The scratch list is reused across cycles so the
/// merge does not allocate once it has grown to the working size.
#[derive(Debug, Default)]
pub struct MidiMerger {
    order: Vec<MergeEntry>,
}

impl MidiMerger {
    /// Creates a merger with room for `events` entries.
    pub fn with_capacity(events: usize) -> Self {
        Self {
            order: Vec::with_capacity(events),
        }
    }

    /// Makes room for at least `events` entries.
    pub fn reserve(&mut self, events: usize) {
        self.order.reserve(events.saturating_sub(self.order.len()));
    }

    /// Clears `dst` and fills it from sources `0..count`.
    ///
    /// Events that no longer fit are counted as lost in `dst`.
    pub fn merge<'a, F>(&mut self, dst: &mut MidiBuffer, count: usize, source: F)
    where
        F: Fn(usize) -> Option<&'a MidiBuffer>,
    {
        dst.clear();
        self.order.clear();
        for s in 0..count {
            let Some(buf) = source(s) else { continue };
            for index in 0..buf.event_count() {
                if let Some(time) = buf.event_time(index) {
                    self.order.push(MergeEntry {
                        time,
                        source: s,
                        index,
                    });
                }
            }
        }
        self.order
            .sort_unstable_by_key(|e| (e.time, e.source, e.index));

        for (pos, entry) in self.order.iter().enumerate() {
            let Some(event) = source(entry.source).and_then(|b| b.get(entry.index)) else {
                continue;
            };
            if let Some(payload) = dst.reserve(event.time, event.bytes.len()) {
                payload.copy_from_slice(event.bytes);
            } else {
                dst.record_lost(self.order.len() - pos);
                break;
            }
        }
    }
}
