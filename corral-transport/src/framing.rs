//! Length-prefixed message framing shared by [`crate::server`] and
//! [`crate::client`].
//!
//! Grounded directly on `cliser.c`'s `sock_send_msg`/`sock_recv_msg`/
//! `sock_recv_msg_peek`: an 8-byte native-endian length header, the
//! [`CodecMode::OutOfProcess`] encoding of one [`Value`] as the payload,
//! and the `0xFFFF...FFFF` length sentinel for a clean remote close.
//!
//! Each connection owns one scratch [`RingBuffer`] per direction, reused
//! across calls — it must be empty (peek() == 0, no open transaction) on
//! entry to [`send_msg`]/[`recv_msg`] and is left empty on return, mirroring
//! the original's per-client `send_rb`/`recv_rb`.

use std::io::{Read, Write};
use std::net::TcpStream;

use corral_core::codec::{Codec, CodecMode};
use corral_core::handle::HandleRegistry;
use corral_core::ring::RingBuffer;
use corral_core::value::Value;

use crate::error::{Result, TransportError};
use crate::fastpath::NetStats;

/// The `0xFFFF...FFFF` length sentinel signalling a clean remote close.
pub const LEN_INVALID: u64 = u64::MAX;

fn read_len<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(TransportError::io)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Writes the `0xFFFF...FFFF` sentinel so the peer's next `recv_msg`
/// recognizes a clean close rather than a connection error.
pub fn send_close_sentinel(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(&LEN_INVALID.to_ne_bytes()).map_err(TransportError::io)
}

/// Encodes `value` into `scratch` and sends it as one length-prefixed
/// message.
pub fn send_msg(
    stream: &mut TcpStream,
    scratch: &mut RingBuffer,
    handles: &HandleRegistry,
    value: &Value,
    stats: &mut NetStats,
) -> Result<()> {
    scratch.push_write_pos();
    let codec = Codec::new(CodecMode::OutOfProcess, handles);
    if let Err(e) = codec.encode(scratch, value) {
        scratch.pop_write_pos();
        return Err(e.into());
    }
    let len = scratch.peek();
    scratch.pop_write_pos();

    stream.write_all(&(len as u64).to_ne_bytes()).map_err(TransportError::io)?;
    stream.write_all(&scratch.buf_ptr()[..len]).map_err(TransportError::io)?;

    stats.num_bytes += (len + 8) as u64;
    stats.num_regions += 1;
    stats.num_calls += 1;
    Ok(())
}

/// Receives one length-prefixed message and decodes it. Rejects the close
/// sentinel and any length exceeding `scratch`'s capacity (the inline size
/// cap the connection was set up with) as a [`TransportError::FatalProtocol`]
/// / [`TransportError::MessageTooLarge`] respectively, matching the
/// original's "remote peer disconnected" / "message size is too large".
pub fn recv_msg(
    stream: &mut TcpStream,
    scratch: &mut RingBuffer,
    handles: &HandleRegistry,
    stats: &mut NetStats,
) -> Result<Value> {
    let len = read_len(stream)?;
    if len == LEN_INVALID {
        return Err(TransportError::FatalProtocol("remote peer disconnected".into()));
    }
    let len = len as usize;
    if len > scratch.capacity() {
        return Err(TransportError::MessageTooLarge(len));
    }

    stream
        .read_exact(&mut scratch.buf_mut_ptr()[..len])
        .map_err(TransportError::io)?;
    scratch.reset_read_pos();
    scratch.push_write_pos();
    scratch.mark_written(len);
    scratch.commit_write_pos();

    let codec = Codec::new(CodecMode::OutOfProcess, handles);
    let value = codec.decode(scratch)?;

    stats.num_bytes += (len + 8) as u64;
    stats.num_regions += 1;
    stats.num_calls += 1;
    Ok(value)
}

/// Non-blocking peek: returns `true` if a full message is already
/// available without consuming it, mirroring `sock_recv_msg_peek`'s
/// `MSG_PEEK | MSG_DONTWAIT` probe. Used by a client's async-style poll
/// before committing to a blocking [`recv_msg`].
pub fn has_pending_message(stream: &TcpStream) -> Result<bool> {
    use std::os::unix::io::AsRawFd;
    let ready = crate::select::select_readable(&[stream.as_raw_fd()], Some(std::time::Duration::ZERO))?;
    Ok(!ready.is_empty())
}
