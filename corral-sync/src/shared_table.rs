//! Thread-safe associative map mediated by the codec, grounded on
//! `sharedtable.c`.
//!
//! The original keeps the table's canonical storage in its own Lua state
//! (a second interpreter, guarded by one mutex) so that sharing structure
//! between isolated worker runtimes has a neutral buffer domain to cross:
//! callers serialize a key in, the table's state deserializes it, looks the
//! value up, serializes the value back out. [`Isolate`] renders that as a
//! private `HashMap` behind its own lock, reached only through
//! `Codec::encode`/`decode` round-trips over a scratch ring; in safe Rust
//! no second interpreter is actually required, but the
//! encode/decode boundary is kept anyway so `Value`s that aren't
//! `Clone`-identical-by-pointer (tables, functions) still go through the
//! same cycle-rejecting, handle-resolving path a cross-thread transfer
//! would.

use std::sync::Arc;

use parking_lot::Mutex;

use corral_core::codec::{Codec, CodecMode};
use corral_core::handle::HandleRegistry;
use corral_core::ring::RingBuffer;
use corral_core::value::Value;

use crate::error::Result;

const SCRATCH_RING_SIZE: usize = 4 * 1024;

struct IsolateState {
    pairs: Vec<(Value, Value)>,
    rb: RingBuffer,
}

/// The private, lock-guarded store backing a [`SharedTable`].
struct Isolate {
    state: Mutex<IsolateState>,
    handles: HandleRegistry,
}

impl Isolate {
    fn new(growth: usize) -> Self {
        Self {
            state: Mutex::new(IsolateState {
                pairs: Vec::new(),
                rb: RingBuffer::new(growth.max(SCRATCH_RING_SIZE)),
            }),
            handles: HandleRegistry::new(),
        }
    }

    fn roundtrip(&self, rb: &mut RingBuffer, value: &Value) -> Result<Value> {
        let codec = Codec::new(CodecMode::InProcess, &self.handles);
        loop {
            rb.push_write_pos();
            match codec.encode(rb, value) {
                Ok(()) => {
                    rb.commit_write_pos();
                    break;
                }
                Err(corral_core::error::CoreError::OutOfBuffer { .. }) => {
                    rb.pop_write_pos();
                    rb.grow_by(SCRATCH_RING_SIZE);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(codec.decode(rb)?)
    }
}

/// A thread-safe associative map whose canonical storage is reached only
/// through a serialize/deserialize boundary (see module docs).
#[derive(Clone)]
pub struct SharedTable {
    isolate: Arc<Isolate>,
}

impl SharedTable {
    /// Creates an empty table. `growth` sizes the scratch ring used for
    /// each key/value round-trip.
    #[must_use]
    pub fn new(growth: usize) -> Self {
        Self {
            isolate: Arc::new(Isolate::new(growth)),
        }
    }

    /// Creates a table pre-populated from `initial`. `move_values` mirrors
    /// the original's `move?` flag: when true, the initial pairs are
    /// adopted directly (no round-trip needed since nothing has crossed a
    /// boundary yet); when false, each pair is round-tripped through the
    /// codec up front so the table holds its own independent copy.
    #[must_use]
    pub fn with_initial(initial: Vec<(Value, Value)>, move_values: bool, growth: usize) -> Self {
        let table = Self::new(growth);
        if move_values {
            table.isolate.state.lock().pairs = initial;
        } else {
            for (k, v) in initial {
                table.write(&k, &v).expect("initial population cannot fail");
            }
        }
        table
    }

    fn key_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            _ => false,
        }
    }

    /// Looks up `key`, round-tripping both the request and the result
    /// through the isolate's codec boundary.
    pub fn read(&self, key: &Value) -> Result<Option<Value>> {
        let mut scratch = RingBuffer::new(SCRATCH_RING_SIZE);
        let key = self.isolate.roundtrip(&mut scratch, key)?;
        let state = self.isolate.state.lock();
        let found = state
            .pairs
            .iter()
            .find(|(k, _)| Self::key_eq(k, &key))
            .map(|(_, v)| v.clone());
        drop(state);
        match found {
            Some(v) => Ok(Some(self.isolate.roundtrip(&mut scratch, &v)?)),
            None => Ok(None),
        }
    }

    /// Writes `key -> value`, round-tripping both through the codec
    /// boundary before storing, replacing any existing entry for `key`.
    pub fn write(&self, key: &Value, value: &Value) -> Result<()> {
        let mut scratch = RingBuffer::new(SCRATCH_RING_SIZE);
        let key = self.isolate.roundtrip(&mut scratch, key)?;
        let value = self.isolate.roundtrip(&mut scratch, value)?;
        let mut state = self.isolate.state.lock();
        if let Some(slot) = state.pairs.iter_mut().find(|(k, _)| Self::key_eq(k, &key)) {
            slot.1 = value;
        } else {
            state.pairs.push((key, value));
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.isolate.state.lock().pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate size in bytes of the table's stored pairs (scratch ring
    /// excluded), mirroring `sharedtable_size`.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let state = self.isolate.state.lock();
        state
            .pairs
            .iter()
            .map(|(k, v)| value_size_estimate(k) + value_size_estimate(v))
            .sum()
    }

    /// A stateful iteration cursor, mirroring `lua_next`: each call to
    /// [`PairsCursor::next`] re-acquires the isolate's lock rather than
    /// holding it across the whole iteration, since in a world where the
    /// table is genuinely shared with live threads holding the lock for
    /// the cursor's lifetime isn't an option.
    #[must_use]
    pub fn pairs(&self) -> PairsCursor {
        PairsCursor {
            isolate: Arc::clone(&self.isolate),
            position: 0,
        }
    }
}

fn value_size_estimate(v: &Value) -> usize {
    match v {
        Value::Nil | Value::Bool(_) => 1,
        Value::Number(_) | Value::Int(_) => 8,
        Value::Str(s) => s.len(),
        Value::Table(t) => {
            let inner = t.0.read();
            inner
                .pairs
                .iter()
                .map(|(k, v)| value_size_estimate(k) + value_size_estimate(v))
                .sum()
        }
        Value::Function(f) => f.chunks.iter().map(Vec::len).sum(),
        Value::Userdata(_) => 8,
    }
}

/// A resumable snapshot-index cursor over a [`SharedTable`]'s pairs.
pub struct PairsCursor {
    isolate: Arc<Isolate>,
    position: usize,
}

impl PairsCursor {
    /// Returns the next `(key, value)` pair, or `None` once exhausted.
    pub fn next(&mut self) -> Option<(Value, Value)> {
        let state = self.isolate.state.lock();
        let pair = state.pairs.get(self.position).cloned();
        drop(state);
        if pair.is_some() {
            self.position += 1;
        }
        pair
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_value() {
        let table = SharedTable::new(4096);
        table
            .write(&Value::Str("k".into()), &Value::Int(7))
            .unwrap();
        let got = table.read(&Value::Str("k".into())).unwrap();
        assert!(matches!(got, Some(Value::Int(7))));
    }

    #[test]
    fn write_overwrites_existing_key() {
        let table = SharedTable::new(4096);
        table.write(&Value::Int(1), &Value::Int(1)).unwrap();
        table.write(&Value::Int(1), &Value::Int(2)).unwrap();
        assert_eq!(table.len(), 1);
        let got = table.read(&Value::Int(1)).unwrap();
        assert!(matches!(got, Some(Value::Int(2))));
    }

    #[test]
    fn pairs_cursor_visits_every_entry_exactly_once() {
        let table = SharedTable::new(4096);
        for i in 0..5 {
            table.write(&Value::Int(i), &Value::Int(i * i)).unwrap();
        }
        let mut cursor = table.pairs();
        let mut seen = Vec::new();
        while let Some((k, v)) = cursor.next() {
            if let (Value::Int(k), Value::Int(v)) = (k, v) {
                seen.push((k, v));
            }
        }
        seen.sort();
        assert_eq!(seen, vec![(0, 0), (1, 1), (2, 4), (3, 9), (4, 16)]);
    }

    #[test]
    fn shared_across_threads_is_consistent() {
        let table = SharedTable::new(4096);
        let writer = table.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..20 {
                writer.write(&Value::Int(i), &Value::Int(i)).unwrap();
            }
        });
        handle.join().unwrap();
        assert_eq!(table.len(), 20);
    }
}
