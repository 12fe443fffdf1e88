//! Per-connection fast-path cache and GPU-memory-handle abstraction.
//!
//! Grounded on `cliser.c`'s `copy_context_t`/`remote_ptr_t`
//! (`cudaIpcMemHandle_t` at `cliser.c:41`). The device IPC calls themselves
//! sit behind [`DeviceBackend`] — a runtime capability discovered per
//! connection rather than the original's compile-time CUDA feature — with
//! [`NullDeviceBackend`] as the only backend shipped here (a real GPU
//! backend is an external collaborator, supplied by the embedding
//! application).

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::RawFd;

use tracing::debug;
use tracing::warn;

use crate::error::{Result, TransportError};
use crate::options::{FastPathCachePolicy, TransportOptions};

/// An opaque, implementation-defined device-memory handle blob (typically
/// 64 bytes for a `cudaIpcMemHandle_t`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle(pub Vec<u8>);

/// A pointer imported from a remote handle, local to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportedPointer(pub u64);

/// Per-connection/per-process device capability, discovered at runtime,
/// with the non-GPU path as the always-present fallback.
pub trait DeviceBackend: Send + Sync {
    fn is_available(&self) -> bool;
    fn device_index(&self) -> i32;
    /// Exports `byte_count` bytes starting at `original_pointer` as a
    /// handle the importing side's `import` can resolve.
    fn export(&self, original_pointer: u64, byte_count: usize) -> DeviceHandle;
    fn import(&self, handle: &DeviceHandle) -> ImportedPointer;
    fn close_import(&self, imported: ImportedPointer);
    fn device_copy(&self, dst: ImportedPointer, src_host: &[u8]);
    fn device_copy_to_host(&self, dst_host: &mut [u8], src: ImportedPointer);
    fn synchronize(&self);
    fn peer_access_possible(&self, other_device: i32) -> bool;
}

/// The always-present fallback: no device present, fast path never
/// negotiates on.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDeviceBackend;

impl DeviceBackend for NullDeviceBackend {
    fn is_available(&self) -> bool {
        false
    }
    fn device_index(&self) -> i32 {
        -1
    }
    fn export(&self, _original_pointer: u64, _byte_count: usize) -> DeviceHandle {
        unreachable!("NullDeviceBackend is never eligible for the fast path")
    }
    fn import(&self, _handle: &DeviceHandle) -> ImportedPointer {
        unreachable!("NullDeviceBackend is never eligible for the fast path")
    }
    fn close_import(&self, _imported: ImportedPointer) {}
    fn device_copy(&self, _dst: ImportedPointer, _src_host: &[u8]) {}
    fn device_copy_to_host(&self, _dst_host: &mut [u8], _src: ImportedPointer) {}
    fn synchronize(&self) {}
    fn peer_access_possible(&self, _other_device: i32) -> bool {
        false
    }
}

/// One cached import: the remote's handle bytes, the remote's original
/// pointer range (for overlap detection), and the locally imported
/// pointer, scoped to the connection (`origin_socket`) it arrived on.
#[derive(Debug, Clone)]
pub struct FastPathEntry {
    pub remote_handle: DeviceHandle,
    pub remote_original_pointer: u64,
    pub remote_byte_count: usize,
    pub local_pointer: ImportedPointer,
    pub origin_socket: RawFd,
}

impl FastPathEntry {
    fn overlaps(&self, other_pointer: u64, other_len: usize) -> bool {
        let a_start = self.remote_original_pointer;
        let a_end = a_start + self.remote_byte_count as u64;
        let b_start = other_pointer;
        let b_end = b_start + other_len as u64;
        a_start < b_end && b_start < a_end
    }
}

/// Byte/call counters, mirroring `net_stats_t`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetStats {
    pub num_bytes: u64,
    pub num_regions: u64,
    pub num_calls: u64,
}

/// Per-connection state for fast/staged numeric transfer: the negotiated
/// fast-path flag, double-buffered staging slots, remote-handle cache, and
/// telemetry counters. Mirrors `copy_context_t`.
pub struct CopyContext {
    pub use_fastpath: bool,
    pub staging: [Vec<u8>; 2],
    cache: VecDeque<FastPathEntry>,
    cache_limit: usize,
    cache_policy: FastPathCachePolicy,
    pub tx: NetStats,
    pub rx: NetStats,
}

impl CopyContext {
    #[must_use]
    pub fn new(options: &TransportOptions) -> Self {
        Self {
            use_fastpath: false,
            staging: [
                vec![0u8; options.fastpath_block_size],
                vec![0u8; options.fastpath_block_size],
            ],
            cache: VecDeque::new(),
            cache_limit: options.fastpath_cache_limit,
            cache_policy: options.fastpath_cache_policy,
            tx: NetStats::default(),
            rx: NetStats::default(),
        }
    }

    /// Looks up a cached import by handle bytes, returning the locally
    /// imported pointer on a hit without touching the backend at all.
    #[must_use]
    pub fn find_cached(&self, handle: &DeviceHandle) -> Option<ImportedPointer> {
        self.cache
            .iter()
            .find(|e| e.remote_handle == *handle)
            .map(|e| e.local_pointer)
    }

    /// Resolves an incoming `(handle, original_pointer, byte_count)` triple
    /// from `origin`, importing through `backend` on a miss. Before
    /// inserting a fresh entry, scans same-origin entries for a pointer
    /// range overlap with the incoming one and evicts any match — the
    /// sender having reused a buffer address is detected and the stale
    /// cache entry is dropped.
    pub fn resolve<B: DeviceBackend>(
        &mut self,
        backend: &B,
        handle: DeviceHandle,
        original_pointer: u64,
        byte_count: usize,
        origin: RawFd,
    ) -> ImportedPointer {
        if let Some(hit) = self.find_cached(&handle) {
            return hit;
        }

        let mut i = 0;
        while i < self.cache.len() {
            let overlaps = self.cache[i].origin_socket == origin
                && self.cache[i].overlaps(original_pointer, byte_count);
            if overlaps {
                let stale = self.cache.remove(i).expect("index in bounds");
                backend.close_import(stale.local_pointer);
                warn!(origin, "fast-path cache entry evicted: pointer range reused");
            } else {
                i += 1;
            }
        }

        if self.cache.len() >= self.cache_limit {
            match self.cache_policy {
                FastPathCachePolicy::Grow => {
                    self.cache_limit += 1;
                }
                FastPathCachePolicy::Evict => {
                    if let Some(oldest) = self.cache.pop_front() {
                        backend.close_import(oldest.local_pointer);
                        warn!("fast-path cache full: evicted oldest entry");
                    }
                }
            }
        }

        let local = backend.import(&handle);
        self.cache.push_back(FastPathEntry {
            remote_handle: handle,
            remote_original_pointer: original_pointer,
            remote_byte_count: byte_count,
            local_pointer: local,
            origin_socket: origin,
        });
        local
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// `can_use_fastpath` (`cliser.c:251`): writes this side's device index,
/// reads the peer's, and agrees to the fast path when both report a real
/// device that can reach each other. Called symmetrically by the
/// connecting side (`cliser_client`) and the accepting side
/// (`cliser_server_clients`) against the same freshly-established socket,
/// so both ends settle on the same `use_fastpath` decision. Skipped
/// entirely, without touching the socket, when `backend` reports no
/// device at all.
pub(crate) fn negotiate_fastpath(stream: &TcpStream, backend: &dyn DeviceBackend) -> Result<bool> {
    if !backend.is_available() {
        return Ok(false);
    }
    let local = stream.local_addr().map_err(TransportError::io)?;
    let peer = stream.peer_addr().map_err(TransportError::io)?;
    if local.ip() != peer.ip() {
        return Ok(false);
    }

    let device = backend.device_index();
    let mut stream = stream.try_clone().map_err(TransportError::io)?;
    stream.write_all(&device.to_ne_bytes()).map_err(TransportError::io)?;
    let mut remote_buf = [0u8; 4];
    stream.read_exact(&mut remote_buf).map_err(TransportError::io)?;
    let remote_device = i32::from_ne_bytes(remote_buf);

    if device == remote_device {
        return Ok(true);
    }
    if backend.peer_access_possible(remote_device) {
        debug!(device, remote_device, "device IPC enabled between peer devices");
        Ok(true)
    } else {
        debug!(device, remote_device, "device IPC not possible between peer devices");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingBackend {
        imports: parking_lot::Mutex<u32>,
    }

    impl DeviceBackend for CountingBackend {
        fn is_available(&self) -> bool {
            true
        }
        fn device_index(&self) -> i32 {
            0
        }
        fn export(&self, _original_pointer: u64, _byte_count: usize) -> DeviceHandle {
            DeviceHandle(vec![0u8; 8])
        }
        fn import(&self, _handle: &DeviceHandle) -> ImportedPointer {
            let mut n = self.imports.lock();
            *n += 1;
            ImportedPointer(u64::from(*n))
        }
        fn close_import(&self, _imported: ImportedPointer) {}
        fn device_copy(&self, _dst: ImportedPointer, _src_host: &[u8]) {}
        fn device_copy_to_host(&self, _dst_host: &mut [u8], _src: ImportedPointer) {}
        fn synchronize(&self) {}
        fn peer_access_possible(&self, _other_device: i32) -> bool {
            true
        }
    }

    fn opts() -> TransportOptions {
        TransportOptions::default()
    }

    #[test]
    fn cache_hit_reuses_same_local_pointer() {
        let backend = CountingBackend {
            imports: parking_lot::Mutex::new(0),
        };
        let mut ctx = CopyContext::new(&opts());
        let handle = DeviceHandle(vec![1, 2, 3]);
        let p1 = ctx.resolve(&backend, handle.clone(), 0x1000, 1000, 7);
        let p2 = ctx.resolve(&backend, handle, 0x1000, 1000, 7);
        assert_eq!(p1, p2);
        assert_eq!(ctx.cache_len(), 1);
    }

    #[test]
    fn overlapping_pointer_from_same_origin_evicts_stale_entry() {
        let backend = CountingBackend {
            imports: parking_lot::Mutex::new(0),
        };
        let mut ctx = CopyContext::new(&opts());
        let h1 = DeviceHandle(vec![1]);
        ctx.resolve(&backend, h1, 0x1000, 1000, 7);
        assert_eq!(ctx.cache_len(), 1);

        let h2 = DeviceHandle(vec![2]);
        ctx.resolve(&backend, h2, 0x1200, 500, 7);
        // h1's range [0x1000, 0x13e8) overlaps h2's [0x1200, 0x13e8+...)
        assert_eq!(ctx.cache_len(), 1);
    }

    #[test]
    fn non_overlapping_different_origin_keeps_both_entries() {
        let backend = CountingBackend {
            imports: parking_lot::Mutex::new(0),
        };
        let mut ctx = CopyContext::new(&opts());
        ctx.resolve(&backend, DeviceHandle(vec![1]), 0x1000, 1000, 7);
        ctx.resolve(&backend, DeviceHandle(vec![2]), 0x1000, 1000, 9);
        assert_eq!(ctx.cache_len(), 2);
    }

    #[test]
    fn cache_evicts_oldest_when_full_under_evict_policy() {
        let backend = CountingBackend {
            imports: parking_lot::Mutex::new(0),
        };
        let options = opts();
        let mut small = options.clone();
        small.fastpath_cache_limit = 2;
        let mut ctx = CopyContext::new(&small);
        ctx.resolve(&backend, DeviceHandle(vec![1]), 0x1000, 10, 1);
        ctx.resolve(&backend, DeviceHandle(vec![2]), 0x2000, 10, 1);
        ctx.resolve(&backend, DeviceHandle(vec![3]), 0x3000, 10, 1);
        assert_eq!(ctx.cache_len(), 2);
        assert!(ctx.find_cached(&DeviceHandle(vec![1])).is_none());
    }

    #[test]
    fn cache_grows_rather_than_evicting_under_grow_policy() {
        let backend = CountingBackend {
            imports: parking_lot::Mutex::new(0),
        };
        let mut small = opts();
        small.fastpath_cache_limit = 1;
        small.fastpath_cache_policy = FastPathCachePolicy::Grow;
        let mut ctx = CopyContext::new(&small);
        ctx.resolve(&backend, DeviceHandle(vec![1]), 0x1000, 10, 1);
        ctx.resolve(&backend, DeviceHandle(vec![2]), 0x2000, 10, 1);
        assert_eq!(ctx.cache_len(), 2);
    }
}
