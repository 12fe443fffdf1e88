//! Recursive lock with a counting barrier, grounded on `mutex.c`.
//!
//! The original is a single `pthread_mutex_t` (recursive attribute) plus one
//! `pthread_cond_t` and an `int64_t barrier` counter living in the same
//! struct. `lock()`/`unlock()` are explicit calls (not scope-guarded), so a
//! plain `parking_lot::Mutex` guard — which must be dropped to unlock —
//! can't model the public API directly; this tracks ownership and recursion
//! depth by hand instead, the same shape `pthread_mutex_t`'s
//! `PTHREAD_MUTEX_RECURSIVE` attribute gives you for free.

use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex as PlMutex};

struct State {
    owner: Option<ThreadId>,
    depth: u32,
    barrier_count: u64,
    /// Incremented every time a barrier round completes, so waiters can
    /// tell a real wakeup from a spurious one even though `barrier_count`
    /// itself resets to zero each round.
    generation: u64,
}

struct Shared {
    state: PlMutex<State>,
    acquire_cond: Condvar,
    barrier_cond: Condvar,
}

/// A reference-counted recursive lock with a companion barrier.
#[derive(Clone)]
pub struct Mutex {
    shared: Arc<Shared>,
}

impl Mutex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: PlMutex::new(State {
                    owner: None,
                    depth: 0,
                    barrier_count: 0,
                    generation: 0,
                }),
                acquire_cond: Condvar::new(),
                barrier_cond: Condvar::new(),
            }),
        }
    }

    /// Acquires the lock. Recursive: the holding thread may call `lock()`
    /// again without deadlocking, each call must be matched by an
    /// `unlock()`.
    pub fn lock(&self) {
        let me = std::thread::current().id();
        let mut state = self.shared.state.lock();
        loop {
            match state.owner {
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(_) => self.shared.acquire_cond.wait(&mut state),
            }
        }
    }

    /// Releases one level of recursion; the lock is only actually freed
    /// once `unlock()` has been called as many times as `lock()` was.
    ///
    /// # Panics
    /// Panics if the calling thread does not currently hold the lock —
    /// the same usage error the original surfaces as an `EPERM` from
    /// `pthread_mutex_unlock`.
    pub fn unlock(&self) {
        let me = std::thread::current().id();
        let mut state = self.shared.state.lock();
        assert_eq!(state.owner, Some(me), "unlock() called by non-owning thread");
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.shared.acquire_cond.notify_one();
        }
    }

    /// Counting rendezvous: blocks every caller until `target` callers have
    /// arrived, then releases them all at once and resets the counter.
    pub fn barrier(&self, target: u64) {
        let mut state = self.shared.state.lock();
        state.barrier_count += 1;
        if state.barrier_count == target {
            state.barrier_count = 0;
            state.generation += 1;
            self.shared.barrier_cond.notify_all();
        } else {
            let my_generation = state.generation;
            while state.generation == my_generation {
                self.shared.barrier_cond.wait(&mut state);
            }
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
