//! Tunable defaults for channels and work queues.
//!
//! Shaped like `corral_core`'s builder-style options: a `..Default::default()`
//! struct rather than a pile of constructor arguments.

/// Default ring size for a freshly created [`crate::channel::Channel`]
/// (`DEFAULT_CHANNEL_SIZE` in the original: 16 KiB).
pub const DEFAULT_CHANNEL_SIZE: usize = 16 * 1024;

/// Default ring size for a freshly created [`crate::workqueue::WorkQueue`]
/// (`DEFAULT_WORKQUEUE_SIZE` in the original: 256 KiB, historically larger
/// than a plain channel's since a queue's questions/answers pair carries
/// whole argument frames rather than one-off values).
pub const DEFAULT_WORKQUEUE_SIZE: usize = 256 * 1024;

/// Per-worker argument/result ring size for [`crate::map_pool::MapPool`]
/// (`MAX_ARG_SIZE` in the original: 16 KiB).
pub const DEFAULT_MAP_ARG_SIZE: usize = 16 * 1024;

/// Options controlling a [`crate::channel::Channel`]'s growth and
/// backpressure behavior.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Initial ring capacity.
    pub initial_size: usize,
    /// Bytes added on each grow-on-write-overflow.
    pub growth_increment: usize,
    /// When set, `write` blocks on a write-available condvar instead of
    /// growing once the ring's live byte count exceeds this mark. `None`
    /// (the default) preserves the original's always-grow behavior; this
    /// completes the `#if TOO_TRICKY` blocking-write mode that
    /// `workqueue.c` wrote but never enabled.
    pub high_water_mark: Option<usize>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_CHANNEL_SIZE,
            growth_increment: DEFAULT_CHANNEL_SIZE,
            high_water_mark: None,
        }
    }
}

impl ChannelOptions {
    #[must_use]
    pub fn with_high_water_mark(mut self, mark: usize) -> Self {
        self.high_water_mark = Some(mark);
        self
    }

    #[must_use]
    pub fn with_size(mut self, initial_size: usize, growth_increment: usize) -> Self {
        self.initial_size = initial_size;
        self.growth_increment = growth_increment;
        self
    }

    /// The options a [`crate::workqueue::WorkQueue`] opens with when the
    /// caller doesn't supply its own: `DEFAULT_WORKQUEUE_SIZE` rather than
    /// a plain channel's smaller default.
    #[must_use]
    pub fn default_workqueue() -> Self {
        Self {
            initial_size: DEFAULT_WORKQUEUE_SIZE,
            growth_increment: DEFAULT_WORKQUEUE_SIZE,
            high_water_mark: None,
        }
    }
}
