//! One-shot fan-out of `N` worker threads, grounded on `map.c`.
//!
//! Each worker gets its own ring, pre-loaded by the spawning thread with
//! `(args.., worker_index + 1)` using the original's "attempt, catch
//! `OutOfBuffer`, pop the transaction, grow by the fixed argument-growth
//! increment, retry" loop (`rb_save_with_growth`). The worker thread
//! deserializes its arguments, invokes the closure, and serializes the
//! results back into the *same* ring object before exiting — `map.c`'s
//! `map_thread_t.rb` is reused as both the inbound argument buffer and the
//! outbound result buffer, and this keeps that shape.
//!
//! There is no embedded interpreter to re-load a function's bytecode into,
//! so the job itself crosses threads as an `Arc<dyn Fn>` rather than a
//! wire-serialized [`corral_core::value::FunctionValue`] — the same "same
//! address space, pass the reference directly" shortcut used for userdata,
//! applied to the one case (a `MapPool` worker thread in this same process)
//! where it's actually available. Arguments and results still cross the
//! ring as real [`Value`]s.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use corral_core::codec::{Codec, CodecMode};
use corral_core::error::CoreError;
use corral_core::handle::HandleRegistry;
use corral_core::ring::RingBuffer;
use corral_core::value::Value;

use crate::error::{Result, SyncError};
use crate::options::DEFAULT_MAP_ARG_SIZE;

/// A job invoked once per worker, receiving the worker's 1-based index and
/// the shared argument list, returning its result values or an error
/// message.
pub type MapFn = Arc<dyn Fn(i32, &[Value]) -> std::result::Result<Vec<Value>, String> + Send + Sync>;

/// An optional pre-init step run once in the worker before the main job,
/// mirroring `map_extended_open`'s function/string/nil dispatch.
pub enum PreInit {
    None,
    /// Arbitrary setup code, run for side effect only (return values, if
    /// any, are discarded — matching the original's `lua_pcall(L, 0, 0, 0)`).
    Code(Arc<dyn Fn() + Send + Sync>),
}

struct Worker {
    ring: Arc<Mutex<RingBuffer>>,
    error: Arc<Mutex<Option<String>>>,
    /// `None` once the handle has been reaped, by [`MapPool::join`] or by
    /// [`MapPool::check_errors`] finding it already finished.
    join: Option<JoinHandle<()>>,
}

/// A one-shot fan-out of worker threads. Create with [`MapPool::spawn`] or
/// [`MapPool::spawn_extended`], collect with [`MapPool::join`].
pub struct MapPool {
    workers: Vec<Worker>,
}

fn encode_with_growth(rb: &mut RingBuffer, codec: &Codec<'_>, value: &Value) {
    loop {
        rb.push_write_pos();
        match codec.encode(rb, value) {
            Ok(()) => {
                rb.commit_write_pos();
                return;
            }
            Err(CoreError::OutOfBuffer { .. }) => {
                rb.pop_write_pos();
                rb.grow_by(DEFAULT_MAP_ARG_SIZE);
            }
            Err(e) => panic!("map argument encoding failed: {e}"),
        }
    }
}

impl MapPool {
    /// Spawns `n` worker threads, each invoking `f(worker_index, &args)`.
    pub fn spawn(n: u32, f: MapFn, args: Vec<Value>) -> Self {
        Self::spawn_extended(n, PreInit::None, f, args)
    }

    /// Like [`Self::spawn`], but runs `pre_init` once in each worker before
    /// `f`, mirroring `map_extended`.
    pub fn spawn_extended(n: u32, pre_init: PreInit, f: MapFn, args: Vec<Value>) -> Self {
        let pre_init = Arc::new(pre_init);
        let mut workers = Vec::with_capacity(n as usize);
        for i in 0..n {
            let handles = HandleRegistry::new();
            let mut rb = RingBuffer::new(DEFAULT_MAP_ARG_SIZE);
            {
                let codec = Codec::new(CodecMode::InProcess, &handles);
                for arg in &args {
                    encode_with_growth(&mut rb, &codec, arg);
                }
                encode_with_growth(&mut rb, &codec, &Value::Int(i64::from(i) + 1));
            }
            let ring = Arc::new(Mutex::new(rb));
            let error = Arc::new(Mutex::new(None));

            let worker_index = i as i64 + 1;
            let job = Arc::clone(&f);
            let worker_ring = Arc::clone(&ring);
            let worker_error = Arc::clone(&error);
            let worker_pre_init = Arc::clone(&pre_init);

            let join = std::thread::Builder::new()
                .name(format!("corral-map-{worker_index}"))
                .spawn(move || {
                    let handles = HandleRegistry::new();
                    let codec = Codec::new(CodecMode::InProcess, &handles);
                    let mut rb = worker_ring.lock();

                    let mut values = Vec::new();
                    while rb.peek() > 0 {
                        match codec.decode(&mut rb) {
                            Ok(v) => values.push(v),
                            Err(e) => {
                                *worker_error.lock() = Some(e.to_string());
                                return;
                            }
                        }
                    }
                    let index = match values.pop() {
                        Some(Value::Int(idx)) => idx as i32,
                        _ => {
                            *worker_error.lock() =
                                Some("map worker argument frame missing index".into());
                            return;
                        }
                    };

                    if let PreInit::Code(init) = worker_pre_init.as_ref() {
                        init();
                    }

                    match job(index, &values) {
                        Ok(results) => {
                            for result in &results {
                                encode_with_growth(&mut rb, &codec, result);
                            }
                        }
                        Err(message) => {
                            *worker_error.lock() = Some(message);
                        }
                    }
                })
                .expect("failed to spawn map worker thread");

            workers.push(Worker { ring, error, join: Some(join) });
        }
        Self { workers }
    }

    /// Joins every worker, draining each ring's results onto a single
    /// vector in per-worker order. If any worker reported an error, it is
    /// raised after every ring has been fully drained (so values from
    /// workers that succeeded are not lost), matching `map_join`'s "collect
    /// everything, then raise with the first failing worker's message."
    pub fn join(self) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        let mut first_error: Option<String> = None;
        for worker in self.workers {
            if let Some(handle) = worker.join {
                handle
                    .join()
                    .map_err(|payload| SyncError::WorkerPanicked(panic_message(&payload)))?;
            }
            let handles = HandleRegistry::new();
            let codec = Codec::new(CodecMode::InProcess, &handles);
            let mut rb = worker.ring.lock();
            while rb.peek() > 0 {
                results.push(codec.decode(&mut rb)?);
            }
            drop(rb);
            if first_error.is_none() {
                if let Some(msg) = worker.error.lock().clone() {
                    first_error = Some(msg);
                }
            }
        }
        if let Some(msg) = first_error {
            return Err(SyncError::WorkerFailed(msg));
        }
        Ok(results)
    }

    /// Non-blocking: reaps every worker whose thread has already finished
    /// (leaving still-running workers untouched) and raises on the first
    /// one that failed, mirroring `map_check_errors`. A finished thread is
    /// always joined here, not just polled for its error flag, so a worker
    /// that panicked outright — rather than returning `Err` through `f` —
    /// is caught as [`SyncError::WorkerPanicked`] instead of staying
    /// invisible until a later [`Self::join`].
    pub fn check_errors(&mut self) -> Result<()> {
        for worker in &mut self.workers {
            let finished = worker.join.as_ref().is_some_and(JoinHandle::is_finished);
            if !finished {
                continue;
            }
            if let Some(handle) = worker.join.take() {
                if let Err(payload) = handle.join() {
                    return Err(SyncError::WorkerPanicked(panic_message(&payload)));
                }
            }
            if let Some(msg) = worker.error.lock().clone() {
                return Err(SyncError::WorkerFailed(msg));
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_squares_preserve_per_worker_order() {
        let f: MapFn = Arc::new(|i, _args| Ok(vec![Value::Int(i64::from(i) * i64::from(i))]));
        let pool = MapPool::spawn(3, f, vec![]);
        let results = pool.join().unwrap();
        let values: Vec<i64> = results
            .into_iter()
            .map(|v| match v {
                Value::Int(n) => n,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![1, 4, 9]);
    }

    #[test]
    fn join_collects_successful_workers_then_raises() {
        let f: MapFn = Arc::new(|i, _args| {
            if i == 2 {
                Err("boom".to_string())
            } else {
                Ok(vec![Value::Int(i64::from(i) * i64::from(i))])
            }
        });
        let pool = MapPool::spawn(3, f, vec![]);
        let err = pool.join().unwrap_err();
        assert!(matches!(err, SyncError::WorkerFailed(ref m) if m == "boom"));
    }

    #[test]
    fn check_errors_surfaces_a_panicking_worker_once_finished() {
        let f: MapFn = Arc::new(|_i, _args| panic!("worker exploded"));
        let mut pool = MapPool::spawn(1, f, vec![]);
        while !pool.workers[0].join.as_ref().is_some_and(JoinHandle::is_finished) {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let err = pool.check_errors().unwrap_err();
        assert!(matches!(err, SyncError::WorkerPanicked(_)));
    }

    #[test]
    fn check_errors_reaps_a_finished_worker_without_blocking_join() {
        let f: MapFn = Arc::new(|i, _args| Ok(vec![Value::Int(i64::from(i))]));
        let mut pool = MapPool::spawn(1, f, vec![]);
        while !pool.workers[0].join.as_ref().is_some_and(JoinHandle::is_finished) {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        pool.check_errors().unwrap();
        let results = pool.join().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Value::Int(1)));
    }

    #[test]
    fn arguments_are_distributed_to_every_worker() {
        let f: MapFn = Arc::new(|i, args| {
            let Value::Int(base) = &args[0] else {
                return Err("expected int arg".to_string());
            };
            Ok(vec![Value::Int(base + i64::from(i))])
        });
        let pool = MapPool::spawn(2, f, vec![Value::Int(100)]);
        let results = pool.join().unwrap();
        let values: Vec<i64> = results
            .into_iter()
            .map(|v| match v {
                Value::Int(n) => n,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![101, 102]);
    }
}
