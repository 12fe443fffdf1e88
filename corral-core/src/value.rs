//! The wire value model.
//!
//! A `Value` is what a [`crate::codec`] serializes and deserializes. Tables
//! and functions are reference types (`Arc<RwLock<..>>`) rather than owned
//! trees: the original format can express a table that refers back to an
//! ancestor of itself, and representing that at all in Rust needs shared,
//! interior-mutable storage even though the codec itself rejects the cycle
//! (see [`crate::codec`]).

use std::sync::Arc;

use parking_lot::RwLock;

use crate::handle::HandleId;

/// Tag byte values from the wire format. `INT` is deliberately `127`,
/// matching the original layout rather than a dense 0..N assignment.
pub mod tag {
    pub const NIL: i8 = 0;
    pub const BOOL: i8 = 1;
    pub const NUMBER: i8 = 2;
    pub const STRING: i8 = 3;
    pub const TABLE: i8 = 4;
    pub const FUNCTION: i8 = 5;
    pub const USERDATA: i8 = 6;
    pub const INT: i8 = 127;
}

/// A serializable value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Int(i64),
    Str(String),
    Table(Table),
    Function(FunctionValue),
    Userdata(UserdataValue),
}

/// A table: an ordered sequence of key/value pairs plus an optional
/// metatable name. Shared by reference so cyclic construction is possible
/// (and therefore detectable) in the first place.
#[derive(Debug, Clone)]
pub struct Table(pub Arc<RwLock<TableInner>>);

#[derive(Debug, Default)]
pub struct TableInner {
    pub pairs: Vec<(Value, Value)>,
    pub metatable_name: Option<String>,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(TableInner::default())))
    }

    #[must_use]
    pub fn with_metatable(name: impl Into<String>) -> Self {
        let t = Self::new();
        t.0.write().metatable_name = Some(name.into());
        t
    }

    pub fn push(&self, key: Value, value: Value) {
        self.0.write().pairs.push((key, value));
    }

    /// Pointer identity, used for cycle detection during encode.
    #[must_use]
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

/// How a function's upvalues are carried across the wire: a function may
/// close over nothing, only the implicit environment, or an explicit
/// caller-chosen set of slots.
#[derive(Debug, Clone)]
pub enum UpvalueMode {
    /// No upvalues at all; the plain code stands alone.
    None,
    /// The only upvalue is the implicit environment. The receiver rebinds
    /// it to its own global environment rather than transmitting it.
    EnvOnly { env_slot_index: i32 },
    /// Caller opted in to upvalue capture: every captured slot rides along
    /// as a nested table keyed by slot index.
    Captured(Table),
}

/// A function: one or more code chunks plus its upvalue disposition.
#[derive(Debug, Clone)]
pub struct FunctionValue {
    /// Chunk-framed bytecode, written as `{len, bytes}` pairs terminated by
    /// a zero-length chunk.
    pub chunks: Vec<Vec<u8>>,
    pub upvalues: UpvalueMode,
}

impl FunctionValue {
    /// Builds a function value from the upvalues a host closure actually
    /// captured, enforcing the codec's opt-in rule: without
    /// `capture_opt_in`, the only upvalue allowed to ride along is the
    /// implicit `_ENV` (`env_slot_index`); anything else is an error
    /// rather than a silent drop of captured state, per §4.2's "a
    /// function with >1 upvalue is an error" rule. `other_upvalues` are
    /// slot-indexed upvalues besides `_ENV`.
    pub fn new(
        chunks: Vec<Vec<u8>>,
        env_slot_index: Option<i32>,
        other_upvalues: Vec<(i32, Value)>,
        capture_opt_in: bool,
    ) -> crate::error::Result<Self> {
        if capture_opt_in {
            let table = Table::new();
            for (slot, value) in other_upvalues {
                table.push(Value::Int(i64::from(slot)), value);
            }
            return Ok(Self {
                chunks,
                upvalues: UpvalueMode::Captured(table),
            });
        }

        if !other_upvalues.is_empty() {
            let total = other_upvalues.len() + usize::from(env_slot_index.is_some());
            return Err(crate::error::CoreError::UncapturedUpvalues(total));
        }

        let upvalues = match env_slot_index {
            Some(env_slot_index) => UpvalueMode::EnvOnly { env_slot_index },
            None => UpvalueMode::None,
        };
        Ok(Self { chunks, upvalues })
    }
}

/// A userdata reference: a named (or negated/anonymous) type tag plus the
/// [`HandleId`] that resolves it in the process-wide registry.
#[derive(Debug, Clone)]
pub struct UserdataValue {
    pub type_name: String,
    /// True when the type had no pre-registered name and `type_name` came
    /// from a `metatablename()`-style fallback (wire tag is negated).
    pub anonymous: bool,
    pub handle: HandleId,
}

impl Value {
    #[must_use]
    pub fn tag(&self) -> i8 {
        match self {
            Value::Nil => tag::NIL,
            Value::Bool(_) => tag::BOOL,
            Value::Number(_) => tag::NUMBER,
            Value::Int(_) => tag::INT,
            Value::Str(_) => tag::STRING,
            Value::Table(_) => tag::TABLE,
            Value::Function(_) => tag::FUNCTION,
            Value::Userdata(u) => {
                if u.anonymous {
                    -tag::USERDATA
                } else {
                    tag::USERDATA
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn no_upvalues_without_opt_in_yields_none_mode() {
        let f = FunctionValue::new(vec![b"code".to_vec()], None, vec![], false).unwrap();
        assert!(matches!(f.upvalues, UpvalueMode::None));
    }

    #[test]
    fn env_only_without_opt_in_is_allowed() {
        let f = FunctionValue::new(vec![b"code".to_vec()], Some(2), vec![], false).unwrap();
        assert!(matches!(f.upvalues, UpvalueMode::EnvOnly { env_slot_index: 2 }));
    }

    #[test]
    fn real_upvalue_without_opt_in_is_rejected() {
        let err = FunctionValue::new(
            vec![b"code".to_vec()],
            Some(0),
            vec![(1, Value::Int(7))],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::UncapturedUpvalues(2)));
    }

    #[test]
    fn opted_in_capture_carries_upvalues_as_a_slot_indexed_table() {
        let f = FunctionValue::new(
            vec![b"code".to_vec()],
            Some(0),
            vec![(1, Value::Int(7)), (2, Value::Str("x".into()))],
            true,
        )
        .unwrap();
        match f.upvalues {
            UpvalueMode::Captured(table) => assert_eq!(table.0.read().pairs.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
