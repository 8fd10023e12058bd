//! Low-level protobuf wire format reading.
//!
//! This module implements the coded reader the traverser pulls bytes
//! through: tag and varint decoding, fixed-width reads, the limit stack
//! that brackets length-delimited regions, and the recursion budget for
//! nested submessages.
//!
//! ## Wire Format Overview
//!
//! Each protobuf field is encoded as:
//! - A varint "tag" containing the field number and wire type
//! - The field data (format depends on wire type)
//!
//! Wire types:
//! - 0: VARINT (int32, int64, uint32, uint64, sint32, sint64, bool, enum)
//! - 1: I64 (fixed64, sfixed64, double)
//! - 2: LEN (string, bytes, embedded messages, packed repeated fields)
//! - 5: I32 (fixed32, sfixed32, float)
//!
//! Wire types 3 and 4 (groups) are not supported and fail the scan.

use crate::error::{Error, Result};

/// Wire type 0: variable-length integer
pub const WIRE_TYPE_VARINT: u32 = 0;
/// Wire type 1: 64-bit fixed-width
pub const WIRE_TYPE_FIXED64: u32 = 1;
/// Wire type 2: length-delimited
pub const WIRE_TYPE_LEN: u32 = 2;
/// Wire type 5: 32-bit fixed-width
pub const WIRE_TYPE_FIXED32: u32 = 5;

/// Default bound on submessage nesting
pub const DEFAULT_RECURSION_LIMIT: u32 = 100;

/// Token returned by [`CodedReader::push_limit`]; holds the limit it replaced
#[must_use]
#[derive(Debug)]
pub struct Limit(usize);

/// Positioned reader over a protobuf wire-format byte buffer.
///
/// A reader always operates under a *limit*: an absolute offset past which
/// no read may advance. Entering a length-delimited region pushes a tighter
/// limit; leaving it restores the previous one. Submessage entry
/// additionally charges the recursion budget.
#[derive(Debug)]
pub struct CodedReader<'a> {
    buf: &'a [u8],
    pos: usize,
    limit: usize,
    recursion_depth: u32,
    recursion_limit: u32,
}

impl<'a> CodedReader<'a> {
    /// Creates a reader over the whole buffer with the default recursion limit
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            limit: buf.len(),
            recursion_depth: 0,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }

    /// Sets the recursion limit for nested submessages
    pub fn with_recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Reads the next field tag.
    ///
    /// Returns 0 when the current limit is exactly exhausted. A literal
    /// zero tag read mid-region is also returned as 0; the caller detects
    /// it via [`CodedReader::consumed_entire_message`].
    pub fn read_tag(&mut self) -> Result<u32> {
        if self.pos == self.limit {
            return Ok(0);
        }
        let v = self.read_varint64()?;
        u32::try_from(v).map_err(|_| Error::bad_proto("field tag does not fit in 32 bits"))
    }

    /// Decodes a base-128 varint of up to 10 bytes
    pub fn read_varint64(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        for i in 0..10 {
            if self.pos >= self.limit {
                return Err(Error::bad_proto("truncated varint"));
            }
            let byte = self.buf[self.pos];
            self.pos += 1;
            result |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(Error::bad_proto("varint longer than 10 bytes"))
    }

    /// Reads a varint and bounds it to the size domain (at most `i32::MAX`)
    pub fn read_varint_size(&mut self) -> Result<usize> {
        let v = self.read_varint64()?;
        if v > i32::MAX as u64 {
            return Err(Error::bad_proto("length-delimited size too large"));
        }
        Ok(v as usize)
    }

    /// Reads a little-endian 32-bit value
    pub fn read_le32(&mut self) -> Result<u32> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    /// Reads a little-endian 64-bit value
    pub fn read_le64(&mut self) -> Result<u64> {
        let bytes = self.read_exact(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    /// Reads exactly `n` bytes, without copying
    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.limit - self.pos {
            return Err(Error::bad_proto("truncated length-delimited field"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Advances past `n` bytes
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.limit - self.pos {
            return Err(Error::bad_proto("skip past end of field"));
        }
        self.pos += n;
        Ok(())
    }

    /// Narrows the limit to the next `n` bytes; returns the displaced limit
    pub fn push_limit(&mut self, n: usize) -> Result<Limit> {
        let new_limit = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.limit)
            .ok_or_else(|| Error::bad_proto("length-delimited field overruns its container"))?;
        Ok(Limit(std::mem::replace(&mut self.limit, new_limit)))
    }

    /// Restores the limit displaced by the matching [`CodedReader::push_limit`]
    pub fn pop_limit(&mut self, limit: Limit) {
        debug_assert!(limit.0 >= self.limit);
        self.limit = limit.0;
    }

    /// Bytes remaining before the current limit
    pub fn bytes_until_limit(&self) -> usize {
        self.limit - self.pos
    }

    /// True when the current limit is exactly exhausted
    pub fn consumed_entire_message(&self) -> bool {
        self.pos == self.limit
    }

    /// Charges the recursion budget and narrows the limit for a submessage.
    ///
    /// Fails with [`Error::RecursionDepthExceeded`] when the budget runs out.
    pub fn incr_recursion_and_push_limit(&mut self, n: usize) -> Result<Limit> {
        self.recursion_depth += 1;
        if self.recursion_depth > self.recursion_limit {
            return Err(Error::RecursionDepthExceeded {
                limit: self.recursion_limit,
            });
        }
        self.push_limit(n)
    }

    /// Leaves a submessage: refunds the recursion budget, restores the limit
    pub fn decr_recursion_and_pop_limit(&mut self, limit: Limit) {
        debug_assert!(self.recursion_depth > 0);
        self.recursion_depth -= 1;
        self.pop_limit(limit);
    }
}

/// Zigzag-decodes a 32-bit value (`sint32`)
pub fn zigzag_decode32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// Zigzag-decodes a 64-bit value (`sint64`)
pub fn zigzag_decode64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Zigzag-encodes a 32-bit value (`sint32`)
pub fn zigzag_encode32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// Zigzag-encodes a 64-bit value (`sint64`)
pub fn zigzag_encode64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}
