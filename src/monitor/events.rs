//! Event stream parsing.
//!
//! The VMM writes JSON documents to the event FIFO one after another, with
//! arbitrary whitespace between them. A single `read` may return several
//! documents, half of one, or both. [`EventBuffer`] accumulates bytes in a
//! fixed-size buffer, drops stray bytes between documents and hands out
//! complete documents in stream order.

use serde::Deserialize;

/// Size of the event buffer (the pipe buffer size).
pub const EVENT_BUFFER_SIZE: usize = 4096;

/// Events emitted by the VMM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `vmm:starting`
    VmmStarting,
    /// `vmm:shutdown`
    VmmShutdown,
    /// `vm:booting`
    Booting,
    /// `vm:booted`
    Booted,
    /// `vm:pausing`
    Pausing,
    /// `vm:paused`
    Paused,
    /// `vm:resuming`
    Resuming,
    /// `vm:resumed`
    Resumed,
    /// `vm:snapshotting`
    Snapshotting,
    /// `vm:snapshotted`
    Snapshotted,
    /// `vm:restoring`
    Restoring,
    /// `vm:restored`
    Restored,
    /// `vm:resizing`
    Resizing,
    /// `vm:resized`
    Resized,
    /// `vm:shutdown`
    Shutdown,
    /// `vm:deleted`
    Deleted,
    /// `cpu_manager:create_vcpu`
    CreateVcpu,
    /// `virtio-device:activated`
    DeviceActivated,
    /// `virtio-device:reset`
    DeviceReset,
    /// Anything else.
    Unknown {
        /// Source field.
        source: String,
        /// Event field.
        event: String,
    },
}

const KNOWN: [(&str, &str, Event); 19] = [
    ("vmm", "starting", Event::VmmStarting),
    ("vmm", "shutdown", Event::VmmShutdown),
    ("vm", "booting", Event::Booting),
    ("vm", "booted", Event::Booted),
    ("vm", "pausing", Event::Pausing),
    ("vm", "paused", Event::Paused),
    ("vm", "resuming", Event::Resuming),
    ("vm", "resumed", Event::Resumed),
    ("vm", "snapshotting", Event::Snapshotting),
    ("vm", "snapshotted", Event::Snapshotted),
    ("vm", "restoring", Event::Restoring),
    ("vm", "restored", Event::Restored),
    ("vm", "resizing", Event::Resizing),
    ("vm", "resized", Event::Resized),
    ("vm", "shutdown", Event::Shutdown),
    ("vm", "deleted", Event::Deleted),
    ("cpu_manager", "create_vcpu", Event::CreateVcpu),
    ("virtio-device", "activated", Event::DeviceActivated),
    ("virtio-device", "reset", Event::DeviceReset),
];

impl Event {
    /// Map a `source`/`event` pair.
    pub fn from_parts(source: &str, event: &str) -> Self {
        KNOWN
            .iter()
            .find(|(s, e, _)| *s == source && *e == event)
            .map(|(_, _, ev)| ev.clone())
            .unwrap_or_else(|| Event::Unknown {
                source: source.to_string(),
                event: event.to_string(),
            })
    }

    /// Position in the table of known events; unknown events map past it.
    pub fn index(&self) -> usize {
        KNOWN
            .iter()
            .position(|(_, _, ev)| ev == self)
            .unwrap_or(KNOWN.len())
    }

    /// Whether the event requires a rescan and rebind of VMM threads.
    pub fn needs_rebind(&self) -> bool {
        matches!(
            self,
            Event::Booted
                | Event::Resumed
                | Event::Restored
                | Event::Resized
                | Event::DeviceActivated
                | Event::DeviceReset
        )
    }
}

/// One decoded document.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    /// Emitter.
    pub source: String,
    /// Event name.
    pub event: String,
    /// Emission time, as reported.
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    /// Free-form properties.
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
}

impl RawEvent {
    /// Typed event.
    pub fn kind(&self) -> Event {
        Event::from_parts(&self.source, &self.event)
    }
}

/// Result of validating the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scan {
    /// Complete documents present.
    pub events: usize,
    /// A document is still open at the end.
    pub incomplete: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Depth {
    depth: usize,
    in_string: bool,
    escape: bool,
}

impl Depth {
    /// Feed one byte; true when it closes a top-level document.
    fn step(&mut self, b: u8) -> bool {
        if self.in_string {
            if self.escape {
                self.escape = false;
            } else if b == b'\\' {
                self.escape = true;
            } else if b == b'"' {
                self.in_string = false;
            }
            return false;
        }
        match b {
            b'"' if self.depth > 0 => self.in_string = true,
            b'{' => self.depth += 1,
            b'}' if self.depth > 0 => {
                self.depth -= 1;
                return self.depth == 0;
            }
            _ => {}
        }
        false
    }
}

/// Fixed-size accumulation buffer for the event stream.
pub struct EventBuffer {
    buf: Vec<u8>,
    fill: usize,
    // state of a document being dropped because it outgrew the buffer
    discard: Option<Depth>,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    /// Buffer of [`EVENT_BUFFER_SIZE`] bytes.
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER_SIZE)
    }

    /// Buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            fill: 0,
            discard: None,
        }
    }

    /// Total size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes held.
    pub fn len(&self) -> usize {
        self.fill
    }

    /// Nothing held.
    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    /// No room for another read.
    pub fn is_full(&self) -> bool {
        self.fill == self.buf.len()
    }

    /// Unused tail to read into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.fill..]
    }

    /// Account for `n` bytes read into [`spare_mut`](Self::spare_mut).
    pub fn commit(&mut self, n: usize) {
        let start = self.fill;
        self.fill = (self.fill + n).min(self.buf.len());

        let Some(mut state) = self.discard.take() else {
            return;
        };
        for i in start..self.fill {
            if state.step(self.buf[i]) {
                tracing::warn!("dropped the rest of an oversized event document");
                self.buf.copy_within(i + 1..self.fill, start);
                self.fill = start + (self.fill - i - 1);
                return;
            }
        }
        self.fill = start;
        self.discard = Some(state);
    }

    /// Copy `data` in as if read from the stream; returns bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = spare.len().min(data.len());
        spare[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }

    /// Count complete documents and remove stray bytes outside documents.
    pub fn validate(&mut self) -> Scan {
        let mut state = Depth::default();
        let mut out = 0;
        let mut events = 0;
        let mut garbage = false;
        let mut dropped = 0;

        for i in 0..self.fill {
            let b = self.buf[i];
            if state.depth == 0 && b != b'{' {
                garbage |= !b.is_ascii_whitespace();
                dropped += 1;
                continue;
            }
            self.buf[out] = b;
            out += 1;
            if state.step(b) {
                events += 1;
            }
        }
        self.fill = out;

        if garbage {
            tracing::warn!(bytes = dropped, "invalid data between event documents");
        }

        Scan {
            events,
            incomplete: state.depth > 0,
        }
    }

    /// Remove and decode every complete document.
    ///
    /// Undecodable documents are logged and skipped. An incomplete tail is
    /// moved to the front; a tail that fills the whole buffer is dropped,
    /// along with the rest of that document as it arrives.
    pub fn drain(&mut self) -> Vec<RawEvent> {
        let mut state = Depth::default();
        let mut start = 0;
        let mut events = Vec::new();

        for i in 0..self.fill {
            let b = self.buf[i];
            if state.depth == 0 && b != b'{' {
                start = i + 1;
                continue;
            }
            if !state.step(b) {
                continue;
            }
            let doc = &self.buf[start..=i];
            if doc.len() >= self.buf.len() {
                tracing::warn!(
                    size = doc.len(),
                    limit = self.buf.len(),
                    "event document too large, ignoring"
                );
            } else {
                match serde_json::from_slice::<RawEvent>(doc) {
                    Ok(ev) => events.push(ev),
                    Err(e) => tracing::warn!(error = %e, "invalid event document from monitor"),
                }
            }
            start = i + 1;
        }

        let start = start.min(self.fill);
        self.buf.copy_within(start..self.fill, 0);
        self.fill -= start;

        if self.is_full() && state.depth > 0 {
            tracing::warn!(
                limit = self.buf.len(),
                "event document exceeds the buffer, dropping it"
            );
            self.fill = 0;
            self.discard = Some(state);
        }

        events
    }
}
