//! Multi-socket readiness waiting via `select(2)`.
//!
//! Grounded directly on `cliser.c`'s own use of `select` (`FD_SET`/`select`
//! around lines 423-428 for the accept-or-timeout loop in `clients()`, and
//! 737-749 for `recv_any`'s ready-socket scan), and on `nix`'s use
//! elsewhere in the pack for raw socket syscalls.

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};

use crate::error::{Result, TransportError};

/// Blocks until at least one of `fds` is readable or `timeout` elapses.
/// Returns the subset of `fds` that are ready, in the same relative order.
/// An empty return with `Ok` means the timeout elapsed with nothing ready.
pub fn select_readable(fds: &[RawFd], timeout: Option<Duration>) -> Result<Vec<RawFd>> {
    if fds.is_empty() {
        return Ok(Vec::new());
    }
    let mut read_set = FdSet::new();
    for &fd in fds {
        read_set.insert(fd);
    }
    let highest = *fds.iter().max().expect("checked non-empty above");
    let mut timeval = timeout.map(|d| TimeVal::new(d.as_secs() as i64, i64::from(d.subsec_micros())));

    let n = select(highest + 1, &mut read_set, None, None, timeval.as_mut())
        .map_err(|e| TransportError::io(std::io::Error::from(e)))?;

    if n == 0 {
        return Ok(Vec::new());
    }
    Ok(fds.iter().copied().filter(|&fd| read_set.contains(fd)).collect())
}
