//! Bit-exact wire layout for contiguous and non-contiguous multidimensional
//! numeric buffers.
//!
//! The core never touches tensor storage directly — it only sees a
//! descriptor of element size, dimension sizes, strides, and contiguity —
//! callers hand this module a byte slice view of the
//! buffer plus a [`TensorDescriptor`], and it either transmits the whole
//! thing in one contiguous run or recurses across outer dimensions to find
//! the largest trailing contiguous chunk.

use std::io::{Read, Write};

use crate::error::{Result, TransportError};

/// Element size, dimension sizes and strides for one contiguous or
/// strided numeric buffer. Strides and sizes are in *elements*, matching
/// the original's `long sizes[]`/`long strides[]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub element_size: usize,
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
}

impl TensorDescriptor {
    #[must_use]
    pub fn n_dim(&self) -> usize {
        self.sizes.len()
    }

    #[must_use]
    pub fn element_count(&self) -> i64 {
        self.sizes.iter().product()
    }

    /// True when the buffer is a single contiguous run top to bottom:
    /// innermost stride 1, and each outer stride equal to the cumulative
    /// element count of the dimensions inside it.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.sizes.is_empty() {
            return true;
        }
        let mut expected = 1i64;
        for i in (0..self.sizes.len()).rev() {
            if self.strides[i] != expected {
                return false;
            }
            expected *= self.sizes[i];
        }
        true
    }

    /// Finds the largest trailing run of dimensions whose strides match
    /// the cumulative inner element count — the unit of one contiguous
    /// transfer for an otherwise-strided tensor. Returns
    /// `(first_outer_dim_index, elements_per_chunk)`. Refuses tensors with
    /// innermost stride != 1 or fewer than 2 dimensions.
    pub fn contiguous_run(&self) -> Result<(usize, i64)> {
        let n = self.sizes.len();
        if n < 2 {
            return Err(TransportError::Other(
                "non-contiguous transfer requires at least 2 dimensions".into(),
            ));
        }
        if self.strides[n - 1] != 1 {
            return Err(TransportError::Other(
                "non-contiguous transfer requires innermost stride == 1".into(),
            ));
        }
        let mut elems = self.sizes[n - 1];
        let mut run_start = n - 1;
        for i in (0..n - 1).rev() {
            if self.strides[i] == elems {
                elems *= self.sizes[i];
                run_start = i;
            } else {
                break;
            }
        }
        Ok((run_start, elems))
    }
}

/// `flags` layout: bit 0 contiguous, bit 1 fast-path-in-use, bits 4-7
/// element size in bytes.
fn pack_flags(desc: &TensorDescriptor, use_fastpath: bool) -> i64 {
    let mut flags = 0i64;
    if desc.is_contiguous() {
        flags |= 1;
    }
    if use_fastpath {
        flags |= 1 << 1;
    }
    flags |= (desc.element_size as i64 & 0xF) << 4;
    flags
}

fn write_i64<W: Write>(w: &mut W, v: i64) -> Result<()> {
    w.write_all(&v.to_ne_bytes()).map_err(TransportError::io)
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(TransportError::io)?;
    Ok(i64::from_ne_bytes(buf))
}

/// Writes `{flags, (size, stride)...}` ahead of the payload.
pub fn write_header<W: Write>(w: &mut W, desc: &TensorDescriptor, use_fastpath: bool) -> Result<()> {
    write_i64(w, pack_flags(desc, use_fastpath))?;
    for i in 0..desc.n_dim() {
        write_i64(w, desc.sizes[i])?;
        write_i64(w, desc.strides[i])?;
    }
    Ok(())
}

/// A decoded header, validated against a local descriptor by
/// [`validate_header`].
pub struct Header {
    pub is_contiguous: bool,
    pub use_fastpath: bool,
    pub element_size: usize,
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
}

/// Reads a header of `n_dim` dimensions (the receiver already knows its
/// own tensor's rank from the call site, same as the original, which reads
/// the receiving tensor's `nDimension` before reading the wire header).
pub fn read_header<R: Read>(r: &mut R, n_dim: usize) -> Result<Header> {
    let flags = read_i64(r)?;
    let mut sizes = Vec::with_capacity(n_dim);
    let mut strides = Vec::with_capacity(n_dim);
    for _ in 0..n_dim {
        sizes.push(read_i64(r)?);
        strides.push(read_i64(r)?);
    }
    Ok(Header {
        is_contiguous: flags & 1 != 0,
        use_fastpath: flags & (1 << 1) != 0,
        element_size: ((flags >> 4) & 0xF) as usize,
        sizes,
        strides,
    })
}

/// Rejects a decoded header that doesn't match the receiver's local
/// tensor exactly.
pub fn validate_header(header: &Header, local: &TensorDescriptor) -> Result<()> {
    if header.element_size != local.element_size
        || header.sizes != local.sizes
        || header.strides != local.strides
        || header.is_contiguous != local.is_contiguous()
    {
        return Err(TransportError::FatalProtocol(
            "numeric transfer header does not match local tensor".into(),
        ));
    }
    Ok(())
}

/// Sends a fully contiguous buffer with no device/staging involved: a
/// direct `send(pointer, count * element_size)`.
pub fn send_contiguous_direct<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    w.write_all(bytes).map_err(TransportError::io)
}

/// Receives a fully contiguous buffer directly into `dst`.
pub fn recv_contiguous_direct<R: Read>(r: &mut R, dst: &mut [u8]) -> Result<()> {
    r.read_exact(dst).map_err(TransportError::io)
}

/// Double-buffered pipeline: stage block `i` while the previous staged
/// block is sent. With no device backend providing true async
/// device-to-host copies, staging collapses to a synchronous `memcpy`
/// into the alternating slot, but the two-slot alternation and
/// block-size chunking are exactly the original shape, ready to overlap
/// with a real async copy once a [`crate::fastpath::DeviceBackend`]
/// provides one.
pub fn send_staged<W: Write>(w: &mut W, bytes: &[u8], block_size: usize) -> Result<()> {
    let mut staging = [vec![0u8; block_size], vec![0u8; block_size]];
    let mut which = 0usize;
    let mut pending: Option<usize> = None; // length of the slot awaiting send

    for chunk in bytes.chunks(block_size) {
        staging[which][..chunk.len()].copy_from_slice(chunk);
        if let Some(len) = pending {
            let prev = which ^ 1;
            w.write_all(&staging[prev][..len]).map_err(TransportError::io)?;
        }
        pending = Some(chunk.len());
        which ^= 1;
    }
    if let Some(len) = pending {
        let last = which ^ 1;
        w.write_all(&staging[last][..len]).map_err(TransportError::io)?;
    }
    Ok(())
}

/// Symmetric staged receive.
pub fn recv_staged<R: Read>(r: &mut R, dst: &mut [u8], block_size: usize) -> Result<()> {
    for chunk in dst.chunks_mut(block_size) {
        r.read_exact(chunk).map_err(TransportError::io)?;
    }
    Ok(())
}

/// Transmits a non-contiguous tensor as the row-major walk over its outer
/// dimensions of one contiguous chunk each.
/// `base` is the tensor's full backing storage (byte-addressable, element
/// offsets computed via `strides`); `element_size` scales element offsets
/// to byte offsets.
pub fn send_noncontiguous<W: Write>(w: &mut W, base: &[u8], desc: &TensorDescriptor) -> Result<()> {
    let (run_start, elems_per_chunk) = desc.contiguous_run()?;
    let chunk_bytes = elems_per_chunk as usize * desc.element_size;
    let outer_sizes = &desc.sizes[..run_start];
    let outer_strides = &desc.strides[..run_start];

    for_each_outer_index(outer_sizes, &mut |idx| {
        let elem_offset: i64 = idx.iter().zip(outer_strides).map(|(i, s)| *i as i64 * s).sum();
        let byte_offset = elem_offset as usize * desc.element_size;
        send_contiguous_direct(w, &base[byte_offset..byte_offset + chunk_bytes])
    })
}

/// Symmetric non-contiguous receive into `base`.
pub fn recv_noncontiguous<R: Read>(r: &mut R, base: &mut [u8], desc: &TensorDescriptor) -> Result<()> {
    let (run_start, elems_per_chunk) = desc.contiguous_run()?;
    let chunk_bytes = elems_per_chunk as usize * desc.element_size;
    let outer_sizes = desc.sizes[..run_start].to_vec();
    let outer_strides = desc.strides[..run_start].to_vec();
    let element_size = desc.element_size;

    let mut result = Ok(());
    for_each_outer_index(&outer_sizes, &mut |idx| {
        let elem_offset: i64 = idx.iter().zip(&outer_strides).map(|(i, s)| *i as i64 * s).sum();
        let byte_offset = elem_offset as usize * element_size;
        if result.is_ok() {
            result = r
                .read_exact(&mut base[byte_offset..byte_offset + chunk_bytes])
                .map_err(TransportError::io);
        }
        Ok(())
    })?;
    result
}

/// Row-major iteration over `sizes.len()` nested counters, innermost last.
fn for_each_outer_index<F>(sizes: &[i64], f: &mut F) -> Result<()>
where
    F: FnMut(&[i64]) -> Result<()>,
{
    if sizes.is_empty() {
        return f(&[]);
    }
    let mut idx = vec![0i64; sizes.len()];
    loop {
        f(&idx)?;
        let mut d = sizes.len() - 1;
        loop {
            idx[d] += 1;
            if idx[d] < sizes[d] {
                break;
            }
            idx[d] = 0;
            if d == 0 {
                return Ok(());
            }
            d -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_and_validates() {
        let desc = TensorDescriptor {
            element_size: 4,
            sizes: vec![4, 3, 2],
            strides: vec![6, 2, 1],
        };
        let mut buf = Vec::new();
        write_header(&mut buf, &desc, false).unwrap();
        let mut cursor = &buf[..];
        let header = read_header(&mut cursor, 3).unwrap();
        validate_header(&header, &desc).unwrap();
    }

    #[test]
    fn mismatched_header_is_rejected() {
        let desc = TensorDescriptor {
            element_size: 4,
            sizes: vec![2, 2],
            strides: vec![2, 1],
        };
        let other = TensorDescriptor {
            element_size: 4,
            sizes: vec![2, 3],
            strides: vec![3, 1],
        };
        let mut buf = Vec::new();
        write_header(&mut buf, &desc, false).unwrap();
        let mut cursor = &buf[..];
        let header = read_header(&mut cursor, 2).unwrap();
        assert!(validate_header(&header, &other).is_err());
    }

    #[test]
    fn fully_contiguous_tensor_is_one_run_of_24() {
        let desc = TensorDescriptor {
            element_size: 4,
            sizes: vec![4, 3, 2],
            strides: vec![6, 2, 1],
        };
        let (run_start, elems) = desc.contiguous_run().unwrap();
        assert_eq!(run_start, 0);
        assert_eq!(elems, 24);
    }

    #[test]
    fn padded_outer_stride_yields_four_chunks_of_six() {
        let desc = TensorDescriptor {
            element_size: 4,
            sizes: vec![4, 3, 2],
            strides: vec![24, 4, 1],
        };
        let (run_start, elems) = desc.contiguous_run().unwrap();
        assert_eq!(run_start, 1);
        assert_eq!(elems, 6);
    }

    #[test]
    fn noncontiguous_round_trip_matches_source_bit_for_bit() {
        // shape [4,3,2], strides [24,4,1] (padding between outer rows):
        // backing storage is 4 rows of 24 elements, only the first 6 used.
        let element_size = 4usize;
        let desc = TensorDescriptor {
            element_size,
            sizes: vec![4, 3, 2],
            strides: vec![24, 4, 1],
        };
        let row_stride_bytes = 24 * element_size;
        let mut src = vec![0u8; row_stride_bytes * 4];
        for row in 0..4 {
            for e in 0..6 {
                let off = row * row_stride_bytes + e * element_size;
                src[off..off + 4].copy_from_slice(&((row * 6 + e) as i32).to_ne_bytes());
            }
        }
        let mut wire = Vec::new();
        send_noncontiguous(&mut wire, &src, &desc).unwrap();
        assert_eq!(wire.len(), 4 * 6 * element_size);

        let mut dst = vec![0u8; row_stride_bytes * 4];
        let mut cursor = &wire[..];
        recv_noncontiguous(&mut cursor, &mut dst, &desc).unwrap();
        for row in 0..4 {
            for e in 0..6 {
                let off = row * row_stride_bytes + e * element_size;
                assert_eq!(&dst[off..off + 4], &src[off..off + 4]);
            }
        }
    }

    #[test]
    fn refuses_innermost_stride_other_than_one() {
        let desc = TensorDescriptor {
            element_size: 4,
            sizes: vec![2, 2],
            strides: vec![1, 2],
        };
        assert!(desc.contiguous_run().is_err());
    }

    #[test]
    fn staged_transfer_round_trips() {
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let mut wire = Vec::new();
        send_staged(&mut wire, &data, 512).unwrap();
        assert_eq!(wire.len(), data.len());
        let mut out = vec![0u8; data.len()];
        let mut cursor = &wire[..];
        recv_staged(&mut cursor, &mut out, 512).unwrap();
        assert_eq!(out, data);
    }
}
