//! Bounded replay buffer for shell and process output.
//!
//! Keeps the most recent `cap` bytes of a byte stream. Each shell session
//! owns one: the PTY reader records every chunk, and a late subscriber
//! receives [`RingBuffer::to_vec`] as its catch-up snapshot before live
//! frames start flowing. Process runners use the same type with a larger,
//! configurable capacity.
//!
//! # Representation
//!
//! A flat `Vec<u8>` plus a write cursor. The vector grows until it reaches
//! capacity; from then on new bytes overwrite the oldest in place and the
//! cursor marks the seam between the logical end and the logical start.
//! Recording a chunk is a memcpy (at most two, when it straddles the seam)
//! with no per-byte shifting and no reallocation after the fill phase.

/// Shell replay capacity: the most recent 16 KiB of PTY output.
pub const SHELL_BUFFER_CAP: usize = 16 * 1024;

/// Default cap for run-alongside process output rings (overridable via
/// `AGENTCTL_PROCESS_BUFFER_MAX_BYTES`).
pub const PROCESS_BUFFER_DEFAULT_CAP: usize = 256 * 1024;

/// Tail-retaining byte buffer of fixed maximum size.
///
/// Writes beyond capacity overwrite the oldest bytes in place; the buffer
/// never holds more than `cap` bytes and never reallocates once full.
#[derive(Debug)]
pub struct RingBuffer {
    /// Backing storage; grows to `cap` during the fill phase, then stays.
    storage: Vec<u8>,
    /// Once full: index of the oldest byte, which is also the next write
    /// position. Meaningless during the fill phase.
    cursor: usize,
    cap: usize,
}

impl RingBuffer {
    /// Create a buffer retaining at most `cap` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `cap == 0`.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0, "RingBuffer capacity must be > 0");
        Self {
            storage: Vec::with_capacity(cap.min(4096)),
            cursor: 0,
            cap,
        }
    }

    /// Whether the fill phase is over and writes wrap.
    fn full(&self) -> bool {
        self.storage.len() == self.cap
    }

    /// Record `data`, overwriting the oldest bytes once at capacity.
    ///
    /// A chunk of `cap` bytes or more replaces the entire contents with its
    /// tail.
    pub fn push(&mut self, mut data: &[u8]) {
        // Oversized chunk: only its tail can survive, so skip the rest.
        if data.len() >= self.cap {
            data = &data[data.len() - self.cap..];
            self.storage.clear();
            self.storage.extend_from_slice(data);
            self.cursor = 0;
            return;
        }

        // Fill phase: append until the storage reaches capacity.
        if !self.full() {
            let room = self.cap - self.storage.len();
            let take = room.min(data.len());
            self.storage.extend_from_slice(&data[..take]);
            data = &data[take..];
            if data.is_empty() {
                return;
            }
            // Storage just reached capacity; wrapping starts at the front.
            self.cursor = 0;
        }

        // Overwrite in place, splitting at the end of storage if needed.
        while !data.is_empty() {
            let until_end = self.cap - self.cursor;
            let take = until_end.min(data.len());
            self.storage[self.cursor..self.cursor + take].copy_from_slice(&data[..take]);
            self.cursor = (self.cursor + take) % self.cap;
            data = &data[take..];
        }
    }

    /// Contiguous copy of the retained bytes, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        if !self.full() {
            return self.storage.clone();
        }
        let mut out = Vec::with_capacity(self.cap);
        out.extend_from_slice(&self.storage[self.cursor..]);
        out.extend_from_slice(&self.storage[..self.cursor]);
        out
    }

    /// Number of retained bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// True when nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Forget everything; capacity is unchanged.
    pub fn clear(&mut self) {
        self.storage.clear();
        self.cursor = 0;
    }

    /// Maximum number of retained bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }
}
