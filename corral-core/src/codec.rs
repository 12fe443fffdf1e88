//! Encode/decode of [`Value`] to and from a [`RingBuffer`].
//!
//! Mirrors `serialize.c`'s tag-prefixed framing: each value starts with a
//! one-byte tag (see [`crate::value::tag`]) followed by a tag-specific
//! body. `size_t` fields are 8 bytes native-endian; `int` fields (upvalue
//! mode, env slot index) are 4 bytes native-endian, matching the
//! original's distinct `size_t`/`int` field widths.

use std::collections::HashSet;

use crate::error::{CoreError, Result};
use crate::handle::HandleRegistry;
use crate::ring::RingBuffer;
use crate::value::{tag, FunctionValue, Table, UpvalueMode, UserdataValue, Value};

/// Whether userdata may cross the wire. Out-of-process codecs (TCP
/// transport) can't resolve a local handle on the far end, so userdata is
/// rejected rather than silently corrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    InProcess,
    OutOfProcess,
}

/// Encodes and decodes values against a shared handle registry.
pub struct Codec<'a> {
    pub mode: CodecMode,
    pub handles: &'a HandleRegistry,
}

impl<'a> Codec<'a> {
    #[must_use]
    pub fn new(mode: CodecMode, handles: &'a HandleRegistry) -> Self {
        Self { mode, handles }
    }

    /// Encodes `value` into `rb`. Assumes the caller has already opened a
    /// ring transaction (`push_write_pos`); on error the caller should
    /// `pop_write_pos` rather than this function managing it, since a
    /// single transaction may cover several top-level `encode_value` calls
    /// is never the intent — one value, one transaction, per spec's
    /// per-value framing.
    pub fn encode(&self, rb: &mut RingBuffer, value: &Value) -> Result<()> {
        let mut visited = HashSet::new();
        self.encode_inner(rb, value, &mut visited)
    }

    fn encode_inner(
        &self,
        rb: &mut RingBuffer,
        value: &Value,
        visited: &mut HashSet<usize>,
    ) -> Result<()> {
        write_i8(rb, value.tag())?;
        match value {
            Value::Nil => Ok(()),
            Value::Bool(b) => write_u8(rb, u8::from(*b)),
            Value::Number(n) => write_bytes(rb, &n.to_ne_bytes()),
            Value::Int(i) => write_bytes(rb, &i.to_ne_bytes()),
            Value::Str(s) => write_string(rb, s),
            Value::Table(t) => self.encode_table(rb, t, visited),
            Value::Function(f) => self.encode_function(rb, f, visited),
            Value::Userdata(u) => self.encode_userdata(rb, u),
        }
    }

    fn encode_table(
        &self,
        rb: &mut RingBuffer,
        table: &Table,
        visited: &mut HashSet<usize>,
    ) -> Result<()> {
        let id = table.identity();
        if !visited.insert(id) {
            return Err(CoreError::CyclicReference);
        }
        let inner = table.0.read();
        for (k, v) in &inner.pairs {
            self.encode_inner(rb, k, visited)?;
            self.encode_inner(rb, v, visited)?;
        }
        drop(inner);
        write_i8(rb, tag::NIL)?;
        let inner = table.0.read();
        let name = inner.metatable_name.as_deref().unwrap_or("");
        write_string(rb, name)?;
        drop(inner);
        visited.remove(&id);
        Ok(())
    }

    fn encode_function(
        &self,
        rb: &mut RingBuffer,
        func: &FunctionValue,
        visited: &mut HashSet<usize>,
    ) -> Result<()> {
        for chunk in &func.chunks {
            write_u64(rb, chunk.len() as u64)?;
            write_bytes(rb, chunk)?;
        }
        write_u64(rb, 0)?;

        match &func.upvalues {
            UpvalueMode::None => write_i32(rb, 0),
            UpvalueMode::EnvOnly { env_slot_index } => {
                write_i32(rb, 1)?;
                write_i32(rb, *env_slot_index)
            }
            UpvalueMode::Captured(table) => {
                write_i32(rb, 2)?;
                self.encode_table(rb, table, visited)
            }
        }
    }

    fn encode_userdata(&self, rb: &mut RingBuffer, ud: &UserdataValue) -> Result<()> {
        if self.mode == CodecMode::OutOfProcess {
            return Err(CoreError::unsupported(
                "userdata cannot cross an out-of-process codec boundary",
            ));
        }
        write_string(rb, &ud.type_name)?;
        write_u64(rb, ud.handle.0)?;
        if !self.handles.retain(ud.handle) {
            return Err(CoreError::UnresolvableHandle(ud.handle.0));
        }
        Ok(())
    }

    /// Decodes one value out of `rb`.
    pub fn decode(&self, rb: &mut RingBuffer) -> Result<Value> {
        let t = read_i8(rb)?;
        match t {
            tag::NIL => Ok(Value::Nil),
            tag::BOOL => Ok(Value::Bool(read_u8(rb)? != 0)),
            tag::NUMBER => Ok(Value::Number(f64::from_ne_bytes(read_array(rb)?))),
            tag::INT => Ok(Value::Int(i64::from_ne_bytes(read_array(rb)?))),
            tag::STRING => Ok(Value::Str(read_string(rb)?)),
            tag::TABLE => self.decode_table(rb),
            tag::FUNCTION => self.decode_function(rb),
            t if t == tag::USERDATA || t == -tag::USERDATA => self.decode_userdata(rb, t < 0),
            other => Err(CoreError::malformed(format!("unknown tag {other}"))),
        }
    }

    fn decode_table(&self, rb: &mut RingBuffer) -> Result<Value> {
        let table = Table::new();
        loop {
            let peek_tag = read_i8(rb)?;
            if peek_tag == tag::NIL {
                break;
            }
            let key = self.decode_tagged(rb, peek_tag)?;
            let value = self.decode(rb)?;
            table.0.write().pairs.push((key, value));
        }
        let name = read_string(rb)?;
        table.0.write().metatable_name = if name.is_empty() { None } else { Some(name) };
        Ok(Value::Table(table))
    }

    /// Decodes a value whose tag byte has already been consumed (used by
    /// the table-pair loop, which must peek a tag to detect the NIL
    /// terminator before committing to decoding a full key).
    fn decode_tagged(&self, rb: &mut RingBuffer, t: i8) -> Result<Value> {
        match t {
            tag::NIL => Ok(Value::Nil),
            tag::BOOL => Ok(Value::Bool(read_u8(rb)? != 0)),
            tag::NUMBER => Ok(Value::Number(f64::from_ne_bytes(read_array(rb)?))),
            tag::INT => Ok(Value::Int(i64::from_ne_bytes(read_array(rb)?))),
            tag::STRING => Ok(Value::Str(read_string(rb)?)),
            tag::TABLE => self.decode_table(rb),
            tag::FUNCTION => self.decode_function(rb),
            t if t == tag::USERDATA || t == -tag::USERDATA => self.decode_userdata(rb, t < 0),
            other => Err(CoreError::malformed(format!("unknown tag {other}"))),
        }
    }

    fn decode_function(&self, rb: &mut RingBuffer) -> Result<Value> {
        let mut chunks = Vec::new();
        loop {
            let len = read_u64(rb)?;
            if len == 0 {
                break;
            }
            let mut chunk = vec![0u8; len as usize];
            read_exact(rb, &mut chunk)?;
            chunks.push(chunk);
        }
        let mode = read_i32(rb)?;
        let upvalues = match mode {
            0 => UpvalueMode::None,
            1 => UpvalueMode::EnvOnly {
                env_slot_index: read_i32(rb)?,
            },
            2 => match self.decode_table(rb)? {
                Value::Table(t) => UpvalueMode::Captured(t),
                _ => unreachable!(),
            },
            other => {
                return Err(CoreError::malformed(format!(
                    "unknown upvalue mode {other}"
                )))
            }
        };
        Ok(Value::Function(FunctionValue { chunks, upvalues }))
    }

    fn decode_userdata(&self, rb: &mut RingBuffer, anonymous: bool) -> Result<Value> {
        if self.mode == CodecMode::OutOfProcess {
            return Err(CoreError::unsupported(
                "userdata cannot cross an out-of-process codec boundary",
            ));
        }
        let type_name = read_string(rb)?;
        let raw = read_u64(rb)?;
        let handle = crate::handle::HandleId(raw);
        if self.handles.get(handle).is_none() {
            return Err(CoreError::UnresolvableHandle(raw));
        }
        Ok(Value::Userdata(UserdataValue {
            type_name,
            anonymous,
            handle,
        }))
    }
}

fn write_bytes(rb: &mut RingBuffer, bytes: &[u8]) -> Result<()> {
    let n = rb.write(bytes);
    if n != bytes.len() {
        return Err(CoreError::out_of_buffer(bytes.len(), rb.free() + n));
    }
    Ok(())
}

fn write_u8(rb: &mut RingBuffer, v: u8) -> Result<()> {
    write_bytes(rb, &[v])
}

fn write_i8(rb: &mut RingBuffer, v: i8) -> Result<()> {
    write_u8(rb, v as u8)
}

fn write_u64(rb: &mut RingBuffer, v: u64) -> Result<()> {
    write_bytes(rb, &v.to_ne_bytes())
}

fn write_i32(rb: &mut RingBuffer, v: i32) -> Result<()> {
    write_bytes(rb, &v.to_ne_bytes())
}

fn write_string(rb: &mut RingBuffer, s: &str) -> Result<()> {
    write_u64(rb, s.len() as u64)?;
    write_bytes(rb, s.as_bytes())
}

fn read_exact(rb: &mut RingBuffer, buf: &mut [u8]) -> Result<()> {
    let n = rb.read(buf);
    if n != buf.len() {
        return Err(CoreError::malformed("stream ended mid-frame"));
    }
    Ok(())
}

fn read_array<const N: usize>(rb: &mut RingBuffer) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    read_exact(rb, &mut buf)?;
    Ok(buf)
}

fn read_u8(rb: &mut RingBuffer) -> Result<u8> {
    Ok(read_array::<1>(rb)?[0])
}

fn read_i8(rb: &mut RingBuffer) -> Result<i8> {
    Ok(read_u8(rb)? as i8)
}

fn read_u64(rb: &mut RingBuffer) -> Result<u64> {
    Ok(u64::from_ne_bytes(read_array(rb)?))
}

fn read_i32(rb: &mut RingBuffer) -> Result<i32> {
    Ok(i32::from_ne_bytes(read_array(rb)?))
}

fn read_string(rb: &mut RingBuffer) -> Result<String> {
    let len = read_u64(rb)? as usize;
    let mut buf = vec![0u8; len];
    read_exact(rb, &mut buf)?;
    String::from_utf8(buf).map_err(|e| CoreError::malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(handles: &HandleRegistry) -> Codec<'_> {
        Codec::new(CodecMode::InProcess, handles)
    }

    #[test]
    fn round_trips_scalars() {
        let handles = HandleRegistry::new();
        let c = codec(&handles);
        let mut rb = RingBuffer::new(256);
        for v in [
            Value::Nil,
            Value::Bool(true),
            Value::Number(3.5),
            Value::Int(-42),
            Value::Str("hello".into()),
        ] {
            rb.push_write_pos();
            c.encode(&mut rb, &v).unwrap();
            rb.commit_write_pos();
        }
        assert!(matches!(c.decode(&mut rb).unwrap(), Value::Nil));
        assert!(matches!(c.decode(&mut rb).unwrap(), Value::Bool(true)));
        match c.decode(&mut rb).unwrap() {
            Value::Number(n) => assert!((n - 3.5).abs() < f64::EPSILON),
            other => panic!("unexpected {other:?}"),
        }
        match c.decode(&mut rb).unwrap() {
            Value::Int(i) => assert_eq!(i, -42),
            other => panic!("unexpected {other:?}"),
        }
        match c.decode(&mut rb).unwrap() {
            Value::Str(s) => assert_eq!(s, "hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn round_trips_table_with_metatable() {
        let handles = HandleRegistry::new();
        let c = codec(&handles);
        let mut rb = RingBuffer::new(256);
        let t = Table::with_metatable("Point");
        t.push(Value::Str("x".into()), Value::Number(1.0));
        t.push(Value::Str("y".into()), Value::Number(2.0));

        rb.push_write_pos();
        c.encode(&mut rb, &Value::Table(t)).unwrap();
        rb.commit_write_pos();

        match c.decode(&mut rb).unwrap() {
            Value::Table(t) => {
                let inner = t.0.read();
                assert_eq!(inner.pairs.len(), 2);
                assert_eq!(inner.metatable_name.as_deref(), Some("Point"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn self_referential_table_is_rejected() {
        let handles = HandleRegistry::new();
        let c = codec(&handles);
        let mut rb = RingBuffer::new(256);
        let t = Table::new();
        t.push(Value::Str("self".into()), Value::Table(t.clone()));

        rb.push_write_pos();
        let err = c.encode(&mut rb, &Value::Table(t)).unwrap_err();
        rb.pop_write_pos();
        assert!(matches!(err, CoreError::CyclicReference));
    }

    #[test]
    fn function_with_no_upvalues_round_trips() {
        let handles = HandleRegistry::new();
        let c = codec(&handles);
        let mut rb = RingBuffer::new(256);
        let func = Value::Function(FunctionValue {
            chunks: vec![b"chunk-one".to_vec(), b"chunk-two".to_vec()],
            upvalues: UpvalueMode::None,
        });
        rb.push_write_pos();
        c.encode(&mut rb, &func).unwrap();
        rb.commit_write_pos();
        match c.decode(&mut rb).unwrap() {
            Value::Function(f) => {
                assert_eq!(f.chunks.len(), 2);
                assert!(matches!(f.upvalues, UpvalueMode::None));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn function_env_only_round_trips() {
        let handles = HandleRegistry::new();
        let c = codec(&handles);
        let mut rb = RingBuffer::new(256);
        let func = Value::Function(FunctionValue {
            chunks: vec![b"code".to_vec()],
            upvalues: UpvalueMode::EnvOnly { env_slot_index: 3 },
        });
        rb.push_write_pos();
        c.encode(&mut rb, &func).unwrap();
        rb.commit_write_pos();
        match c.decode(&mut rb).unwrap() {
            Value::Function(f) => match f.upvalues {
                UpvalueMode::EnvOnly { env_slot_index } => assert_eq!(env_slot_index, 3),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn userdata_round_trips_and_retains_handle() {
        let handles = HandleRegistry::new();
        let id = handles.register(vec![1u8, 2, 3]);
        let c = codec(&handles);
        let mut rb = RingBuffer::new(256);
        let ud = Value::Userdata(UserdataValue {
            type_name: "Buffer".into(),
            anonymous: false,
            handle: id,
        });
        rb.push_write_pos();
        c.encode(&mut rb, &ud).unwrap();
        rb.commit_write_pos();
        assert_eq!(handles.strong_count(id), 2);
        match c.decode(&mut rb).unwrap() {
            Value::Userdata(u) => assert_eq!(u.type_name, "Buffer"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn userdata_rejected_out_of_process() {
        let handles = HandleRegistry::new();
        let id = handles.register(7i32);
        let c = Codec::new(CodecMode::OutOfProcess, &handles);
        let mut rb = RingBuffer::new(256);
        let ud = Value::Userdata(UserdataValue {
            type_name: "Int".into(),
            anonymous: false,
            handle: id,
        });
        rb.push_write_pos();
        let err = c.encode(&mut rb, &ud).unwrap_err();
        rb.pop_write_pos();
        assert!(matches!(err, CoreError::Unsupported(_)));
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let handles = HandleRegistry::new();
        let c = codec(&handles);
        let mut rb = RingBuffer::new(16);
        rb.push_write_pos();
        write_i8(&mut rb, 111).unwrap();
        rb.commit_write_pos();
        let err = c.decode(&mut rb).unwrap_err();
        assert!(matches!(err, CoreError::Malformed(_)));
    }
}
