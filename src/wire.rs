//! TLS-specific helpers for parsing and serializing binary wire structures.
//!
//! Mirrors the length-prefixed vector convention used throughout RFC 8446:
//! the number of bytes used to encode a length prefix is the minimum needed
//! to represent `max_bytes`.

use bytes::{Buf, Bytes};

use crate::error::{internal_error, Error, Result};
use crate::tls::alert::AlertDescription;

pub const U8_LIMIT: usize = u8::MAX as usize;
pub const U16_LIMIT: usize = u16::MAX as usize;
pub const U24_LIMIT: usize = 1 << 24;
pub const U32_LIMIT: usize = u32::MAX as usize;

fn bad_parse(message: impl Into<String>) -> Error {
    Error::fatal(AlertDescription::decode_error, message)
}

/// A cursor over a borrowed byte slice, used while parsing incoming
/// handshake messages.
pub struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(bad_parse("Unexpected end of buffer"));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn len_prefix(&mut self, max_bytes: usize) -> Result<usize> {
        Ok(if max_bytes <= U8_LIMIT {
            self.u8()? as usize
        } else if max_bytes <= U16_LIMIT {
            self.u16()? as usize
        } else if max_bytes <= U24_LIMIT {
            self.u24()? as usize
        } else if max_bytes <= U32_LIMIT {
            self.u32()? as usize
        } else {
            return Err(internal_error("Maximum length not supported"));
        })
    }

    /// Reads a TLS `opaque data<min_bytes..max_bytes>` vector.
    pub fn varlen_vector(&mut self, min_bytes: usize, max_bytes: usize) -> Result<Bytes> {
        let len = self.len_prefix(max_bytes)?;
        if len < min_bytes || len > max_bytes {
            return Err(bad_parse("Length out of allowed range"));
        }
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    /// Splits off a length-prefixed sub-vector and hands back a reader over
    /// just its contents, without copying.
    pub fn vector_reader(&mut self, min_bytes: usize, max_bytes: usize) -> Result<Reader<'a>> {
        let len = self.len_prefix(max_bytes)?;
        if len < min_bytes || len > max_bytes {
            return Err(bad_parse("Length out of allowed range"));
        }
        Ok(Reader::new(self.take(len)?))
    }
}

/// Writes a TLS `opaque data<min_bytes..max_bytes>` vector using the
/// deferred-length back-patch pattern: reserve the length field, run the
/// closure to write the payload, then patch in the final size.
pub fn serialize_varlen_vector<F: FnOnce(&mut Vec<u8>)>(
    min_bytes: usize,
    max_bytes: usize,
    out: &mut Vec<u8>,
    f: F,
) {
    let i = out.len();
    let n = if max_bytes <= U8_LIMIT {
        1
    } else if max_bytes <= U16_LIMIT {
        2
    } else if max_bytes <= U24_LIMIT {
        3
    } else if max_bytes <= U32_LIMIT {
        4
    } else {
        panic!("Maximum length not supported");
    };

    out.resize(i + n, 0);
    let body_start = out.len();

    f(out);

    let size = out.len() - body_start;
    debug_assert!(size >= min_bytes && size <= max_bytes);

    match n {
        1 => out[i] = size as u8,
        2 => out[i..i + 2].copy_from_slice(&(size as u16).to_be_bytes()),
        3 => {
            let b = (size as u32).to_be_bytes();
            out[i..i + 3].copy_from_slice(&b[1..4]);
        }
        4 => out[i..i + 4].copy_from_slice(&(size as u32).to_be_bytes()),
        _ => unreachable!(),
    }
}

pub fn buf_take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(bad_parse("Unexpected end of buffer"));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

/// Consumes leading bytes from a `bytes::Bytes` the same way `Buf::advance`
/// would, returning the consumed prefix.
pub fn bytes_take(data: &mut Bytes, n: usize) -> Result<Bytes> {
    if data.remaining() < n {
        return Err(bad_parse("Unexpected end of buffer"));
    }
    Ok(data.split_to(n))
}
