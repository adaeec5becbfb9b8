//! Bounded binary cursors over mapped file regions.
//!
//! All multi-byte integers and floats are big-endian on the wire. `v64` is
//! the variable-length integer encoding: little-endian base-128 groups with
//! a continuation high bit, where a ninth byte contributes all eight bits,
//! so any 64-bit value fits in at most nine bytes.

use std::io::{self, Write};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use thiserror::Error;

/// Errors of the byte-level cursor.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("read past the end of the mapped region at offset {at}")]
    BufferOverflow { at: usize },
    #[error("v64 value {0} does not fit the narrowed type")]
    Narrowing(i64),
}

/// A positioned reader over a region of the input mapping.
///
/// Views created with [`MappedInStream::view`] are bounded: a chunk decoder
/// operating on a view cannot read outside its declared byte range.
pub struct MappedInStream<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MappedInStream<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bounded view over `[begin, end)` of the underlying region.
    pub fn view(&self, begin: usize, end: usize) -> Result<MappedInStream<'a>, StreamError> {
        if begin > end || end > self.buf.len() {
            return Err(StreamError::BufferOverflow { at: end });
        }
        Ok(MappedInStream {
            buf: &self.buf[begin..end],
            pos: 0,
        })
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], StreamError> {
        let end = self
            .pos
            .checked_add(count)
            .ok_or(StreamError::BufferOverflow { at: self.pos })?;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(StreamError::BufferOverflow { at: self.buf.len() })?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], StreamError> {
        self.take(count)
    }

    pub fn read_u8(&mut self) -> Result<u8, StreamError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, StreamError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16, StreamError> {
        Ok(BigEndian::read_i16(self.take(2)?))
    }

    pub fn read_i32(&mut self) -> Result<i32, StreamError> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub fn read_i64(&mut self) -> Result<i64, StreamError> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    pub fn read_f32(&mut self) -> Result<f32, StreamError> {
        Ok(BigEndian::read_f32(self.take(4)?))
    }

    pub fn read_f64(&mut self) -> Result<f64, StreamError> {
        Ok(BigEndian::read_f64(self.take(8)?))
    }

    /// One byte; zero is false, anything else is true.
    pub fn read_bool(&mut self) -> Result<bool, StreamError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_v64(&mut self) -> Result<i64, StreamError> {
        let mut v = 0u64;
        for i in 0..9 {
            let b = self.read_u8()?;
            if i == 8 {
                v |= u64::from(b) << 56;
                break;
            }
            v |= u64::from(b & 0x7f) << (7 * i);
            if b & 0x80 == 0 {
                break;
            }
        }
        Ok(v as i64)
    }

    /// A v64 narrowed to 32 bits.
    pub fn read_v32(&mut self) -> Result<i32, StreamError> {
        let v = self.read_v64()?;
        i32::try_from(v).map_err(|_| StreamError::Narrowing(v))
    }
}

/// Number of bytes the v64 encoding of `v` occupies.
#[must_use]
pub fn v64_len(v: i64) -> u64 {
    let mut rest = (v as u64) >> 7;
    let mut len = 1;
    while rest != 0 && len < 9 {
        len += 1;
        rest >>= 7;
    }
    len
}

/// Extension over [`Write`] for the variable-length integer encoding.
///
/// Fixed-width writers come from `byteorder::WriteBytesExt`; this adds the
/// one encoding byteorder does not know about.
pub trait V64Write: WriteBytesExt {
    fn write_v64(&mut self, v: i64) -> io::Result<()> {
        let mut u = v as u64;
        for _ in 0..8 {
            if u < 0x80 {
                return self.write_u8(u as u8);
            }
            self.write_u8((u as u8) | 0x80)?;
            u >>= 7;
        }
        self.write_u8(u as u8)
    }
}

impl<W: Write + ?Sized> V64Write for W {}
