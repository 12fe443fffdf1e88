//! Bounded, growable, thread-safe message channel.
//!
//! Grounded on `channel.c`: one ring, one mutex, one read-available condvar,
//! `closed`/`drained` flags and an item count. Writes never block; on ring
//! overflow they grow the ring (or, if [`ChannelOptions::high_water_mark`]
//! is set, block on a write-available condvar instead — the
//! `#if TOO_TRICKY` branch the original wrote but never enabled).

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use corral_core::codec::{Codec, CodecMode};
use corral_core::error::CoreError;
use corral_core::handle::HandleRegistry;
use corral_core::ring::RingBuffer;
use corral_core::value::Value;

use crate::error::Result;
use crate::options::ChannelOptions;

/// Status returned from a channel operation, mirroring the original's
/// `:open`/`:closed`/`:drained` strings — so client code can branch on the
/// return value without exception handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Open,
    Closed,
    Drained,
}

struct Inner {
    rb: RingBuffer,
    closed: bool,
    drained: bool,
    num_items: u32,
}

struct Shared {
    state: Mutex<Inner>,
    read_avail: Condvar,
    write_avail: Condvar,
    handles: HandleRegistry,
    options: ChannelOptions,
}

/// A reference-counted, thread-safe message channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Creates a fresh channel with default options (16 KiB ring,
    /// grow-on-write, no backpressure).
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(ChannelOptions::default())
    }

    #[must_use]
    pub fn with_options(options: ChannelOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Inner {
                    rb: RingBuffer::new(options.initial_size),
                    closed: false,
                    drained: false,
                    num_items: 0,
                }),
                read_avail: Condvar::new(),
                write_avail: Condvar::new(),
                handles: HandleRegistry::new(),
                options,
            }),
        }
    }

    fn codec(&self) -> Codec<'_> {
        Codec::new(CodecMode::InProcess, &self.shared.handles)
    }

    /// Pushes one or more values. Returns the channel's status as of
    /// completion (`Open` unless the channel was already `Closed`/`Drained`,
    /// in which case nothing is written).
    pub fn write(&self, values: &[Value]) -> Result<Status> {
        let mut inner = self.shared.state.lock();
        if inner.drained {
            return Ok(Status::Drained);
        }
        if inner.closed {
            return Ok(Status::Closed);
        }
        let codec = self.codec();
        for value in values {
            loop {
                inner.rb.push_write_pos();
                match codec.encode(&mut inner.rb, value) {
                    Ok(()) => {
                        inner.rb.commit_write_pos();
                        inner.num_items += 1;
                        break;
                    }
                    Err(CoreError::OutOfBuffer { .. }) => {
                        inner.rb.pop_write_pos();
                        if let Some(hwm) = self.shared.options.high_water_mark {
                            if inner.rb.peek() > hwm {
                                self.shared.write_avail.wait(&mut inner);
                                continue;
                            }
                        }
                        let inc = self.shared.options.growth_increment;
                        inner.rb.grow_by(inc);
                        trace!(new_capacity = inner.rb.capacity(), "channel ring grown");
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        }
        self.shared.read_avail.notify_one();
        Ok(Status::Open)
    }

    /// Pops one value. See [`Status`] for the returned-status semantics.
    /// When `non_blocking` is true and no item is available, returns the
    /// current status with no value rather than waiting.
    pub fn read(&self, non_blocking: bool) -> Result<(Status, Option<Value>)> {
        let mut inner = self.shared.state.lock();
        loop {
            if inner.num_items > 0 {
                let codec = self.codec();
                let value = codec.decode(&mut inner.rb)?;
                inner.num_items -= 1;
                let just_drained = inner.closed && inner.num_items == 0;
                if just_drained {
                    inner.drained = true;
                    self.shared.read_avail.notify_all();
                }
                self.shared.write_avail.notify_one();
                let status = if inner.closed { Status::Closed } else { Status::Open };
                return Ok((status, Some(value)));
            } else if inner.drained {
                return Ok((Status::Drained, None));
            } else if non_blocking {
                let status = if inner.closed { Status::Closed } else { Status::Open };
                return Ok((status, None));
            } else {
                self.shared.read_avail.wait(&mut inner);
            }
        }
    }

    /// Marks the channel closed. If it is already empty, it transitions
    /// straight to `Drained`. Idempotent.
    pub fn close(&self) {
        let mut inner = self.shared.state.lock();
        if !inner.closed {
            inner.closed = true;
            if inner.num_items == 0 {
                inner.drained = true;
            }
            debug!(drained = inner.drained, "channel closed");
            self.shared.read_avail.notify_all();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.shared.state.lock().drained
    }

    #[must_use]
    pub fn num_items(&self) -> u32 {
        self.shared.state.lock().num_items
    }

    /// Blocks until `num_items` reaches at least `target`, without consuming
    /// a value. Used by [`crate::workqueue::WorkQueue::drain`] to wait for
    /// `answers` to catch up. The check and the wait happen under the same
    /// lock acquisition so a write that lands between a caller's own
    /// predicate check and the call to wait can't be missed (a lock-drop in
    /// between, as a separate `num_items()` call followed by a separate
    /// wait, would let exactly that notification slip past unseen).
    pub(crate) fn wait_until_num_items_at_least(&self, target: u32) {
        let mut inner = self.shared.state.lock();
        while inner.num_items < target {
            self.shared.read_avail.wait(&mut inner);
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn close_then_drain_sequence_matches_scenario_1() {
        let ch = Channel::new();
        ch.write(&[
            Value::Str("x".into()),
            Value::Str("y".into()),
            Value::Str("z".into()),
        ])
        .unwrap();
        ch.close();

        let (s1, v1) = ch.read(false).unwrap();
        assert_eq!(s1, Status::Open);
        assert!(matches!(v1, Some(Value::Str(ref s)) if s == "x"));

        let (s2, _) = ch.read(false).unwrap();
        assert_eq!(s2, Status::Open);

        let (s3, v3) = ch.read(false).unwrap();
        assert_eq!(s3, Status::Closed);
        assert!(matches!(v3, Some(Value::Str(ref s)) if s == "z"));

        let (s4, v4) = ch.read(false).unwrap();
        assert_eq!(s4, Status::Drained);
        assert!(v4.is_none());
    }

    #[test]
    fn fifo_order_is_preserved_across_threads() {
        let ch = Channel::new();
        let writer = ch.clone();
        let handle = thread::spawn(move || {
            for i in 0..50 {
                writer.write(&[Value::Int(i)]).unwrap();
            }
            writer.close();
        });
        let mut seen = Vec::new();
        loop {
            let (status, value) = ch.read(false).unwrap();
            if let Some(Value::Int(i)) = value {
                seen.push(i);
            }
            if status == Status::Drained {
                break;
            }
        }
        handle.join().unwrap();
        let expected: Vec<i64> = (0..50).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn non_blocking_read_on_empty_open_channel_returns_open_with_no_value() {
        let ch = Channel::new();
        let (status, value) = ch.read(true).unwrap();
        assert_eq!(status, Status::Open);
        assert!(value.is_none());
    }

    #[test]
    fn write_grows_ring_rather_than_blocking_by_default() {
        let ch = Channel::with_options(ChannelOptions::default().with_size(8, 8));
        let long = Value::Str("x".repeat(64));
        ch.write(std::slice::from_ref(&long)).unwrap();
        let (status, value) = ch.read(false).unwrap();
        assert_eq!(status, Status::Open);
        assert!(matches!(value, Some(Value::Str(s)) if s.len() == 64));
    }

    #[test]
    fn write_after_close_returns_closed_status() {
        let ch = Channel::new();
        ch.close();
        let status = ch.write(&[Value::Nil]).unwrap();
        assert_eq!(status, Status::Closed);
    }
}
