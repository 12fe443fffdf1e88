//! Tunable constants for the transport layer: one builder struct covering
//! every tunable surface.

use std::time::Duration;

/// Inline message size cap (`SEND_RECV_SIZE` in the original): 16 KiB.
pub const DEFAULT_INLINE_SIZE_CAP: usize = 16 * 1024;

/// Default connect retry timeout: 5 minutes at 1 Hz.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// Accept-window duration used by `Transport::clients`.
pub const DEFAULT_ACCEPT_WINDOW: Duration = Duration::from_secs(30);

/// TCP keepalive idle/interval/count (non-macOS).
pub const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_COUNT: u32 = 8;

/// Default fast-path handle cache size.
pub const DEFAULT_FASTPATH_CACHE_LIMIT: usize = 256;

/// Fast-path staged double-buffer block size: 512 KiB.
pub const DEFAULT_FASTPATH_BLOCK_SIZE: usize = 512 * 1024;

/// What happens when the fast-path cache is full and a new handle arrives:
/// grow the cache, or (the historical behavior) evict the oldest entry and
/// log a warning. `cliser.c` only ever implements `Evict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathCachePolicy {
    Evict,
    Grow,
}

/// Builder-style options struct covering every transport tunable.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub accept_window: Duration,
    pub keepalive_idle: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count: u32,
    pub inline_size_cap: usize,
    pub fastpath_cache_limit: usize,
    pub fastpath_block_size: usize,
    pub fastpath_cache_policy: FastPathCachePolicy,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            accept_window: DEFAULT_ACCEPT_WINDOW,
            keepalive_idle: DEFAULT_KEEPALIVE_IDLE,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_count: DEFAULT_KEEPALIVE_COUNT,
            inline_size_cap: DEFAULT_INLINE_SIZE_CAP,
            fastpath_cache_limit: DEFAULT_FASTPATH_CACHE_LIMIT,
            fastpath_block_size: DEFAULT_FASTPATH_BLOCK_SIZE,
            fastpath_cache_policy: FastPathCachePolicy::Evict,
        }
    }
}

impl TransportOptions {
    #[must_use]
    pub fn with_fastpath_cache_policy(mut self, policy: FastPathCachePolicy) -> Self {
        self.fastpath_cache_policy = policy;
        self
    }

    #[must_use]
    pub fn with_inline_size_cap(mut self, cap: usize) -> Self {
        self.inline_size_cap = cap;
        self
    }
}
