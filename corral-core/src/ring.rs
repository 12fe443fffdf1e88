//! Growable byte ring with transactional write-position checkpointing.
//!
//! Mirrors the original `ringbuffer_t`: a fixed-capacity byte buffer with
//! read pointer `rp`, write pointer `wp`, readable-byte count `rcb`, and a
//! single saved `(wp, rcb)` pair for undoing a partial write. Nested
//! transactions are not supported — a second `push_write_pos` before the
//! first is popped is a logic error.

use tracing::trace;

/// A wraparound byte FIFO with a checkpointable write position.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    rp: usize,
    wp: usize,
    rcb: usize,
    saved_wp: Option<usize>,
    saved_rcb: usize,
}

impl RingBuffer {
    /// Creates a new ring with the given byte capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            rp: 0,
            wp: 0,
            rcb: 0,
            saved_wp: None,
            saved_rcb: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of bytes currently readable.
    #[must_use]
    pub fn peek(&self) -> usize {
        self.rcb
    }

    #[must_use]
    pub fn free(&self) -> usize {
        self.buf.len() - self.rcb
    }

    /// Copies `min(src.len(), free space)` bytes in, wrapping as needed.
    /// Returns the number of bytes actually written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let cap = self.buf.len();
        let n = src.len().min(cap - self.rcb);
        for byte in src.iter().take(n) {
            self.buf[self.wp] = *byte;
            self.wp = (self.wp + 1) % cap;
        }
        self.rcb += n;
        n
    }

    /// Copies `min(dst.len(), readable)` bytes out, wrapping as needed.
    /// Returns the number of bytes actually read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let cap = self.buf.len();
        let n = dst.len().min(self.rcb);
        for slot in dst.iter_mut().take(n) {
            *slot = self.buf[self.rp];
            self.rp = (self.rp + 1) % cap;
        }
        self.rcb -= n;
        n
    }

    /// Saves `(wp, rcb)` so a partial write can be undone with
    /// [`Self::pop_write_pos`]. Panics if a transaction is already open.
    pub fn push_write_pos(&mut self) {
        assert!(
            self.saved_wp.is_none(),
            "nested ring buffer transactions are not supported"
        );
        self.saved_wp = Some(self.wp);
        self.saved_rcb = self.rcb;
    }

    /// Restores `(wp, rcb)` to the last [`Self::push_write_pos`], discarding
    /// everything written since. Bytes already written past the old `wp`
    /// remain in the backing array but are unreachable (will be
    /// overwritten by the next write).
    pub fn pop_write_pos(&mut self) {
        let wp = self
            .saved_wp
            .take()
            .expect("pop_write_pos without a matching push_write_pos");
        self.wp = wp;
        self.rcb = self.saved_rcb;
    }

    /// Commits the open transaction without discarding the bytes written.
    pub fn commit_write_pos(&mut self) {
        self.saved_wp
            .take()
            .expect("commit_write_pos without a matching push_write_pos");
    }

    /// Whether a transaction is currently open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.saved_wp.is_some()
    }

    /// Resets the read pointer to offset 0. Used after a fresh receipt
    /// writes a whole payload starting at offset 0.
    pub fn reset_read_pos(&mut self) {
        self.rp = 0;
    }

    /// Advances `wp`/`rcb` by `n` bytes without copying, for a caller that
    /// has already written directly into [`Self::buf_mut_ptr`] (a socket
    /// `recv` straight into the backing array, bypassing [`Self::write`]).
    /// Mirrors the original's `ringbuffer_write(rb, NULL, n)` null-source
    /// form. Caller must ensure `n <= free()`.
    pub fn mark_written(&mut self, n: usize) {
        debug_assert!(n <= self.free(), "mark_written past free space");
        let cap = self.buf.len();
        self.wp = (self.wp + n) % cap;
        self.rcb += n;
    }

    /// Raw access to the backing storage, for contiguous direct I/O after
    /// [`Self::reset_read_pos`].
    #[must_use]
    pub fn buf_ptr(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn buf_mut_ptr(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Reallocates at `capacity + n`, linearizing the readable region at
    /// offset 0 and clearing any saved transaction state (a transaction
    /// can't survive a reallocation since it describes offsets into the
    /// old buffer).
    pub fn grow_by(&mut self, n: usize) {
        let old_cap = self.buf.len();
        let new_cap = old_cap + n;
        let mut new_buf = vec![0u8; new_cap];
        let readable = self.rcb;
        for i in 0..readable {
            new_buf[i] = self.buf[(self.rp + i) % old_cap];
        }
        self.buf = new_buf;
        self.rp = 0;
        self.wp = readable % new_cap;
        self.saved_wp = None;
        self.saved_rcb = 0;
        trace!(old_cap, new_cap, "ring buffer grown");
    }
}
