//! Streaming traversal of protobuf wire format.
//!
//! This module walks a payload in a single pass and routes every field
//! through a chain of visitors without ever materializing the decoded
//! message. The traverser owns a stack of visitor positions; the visitor
//! currently on top receives the events for the region being read and
//! decides, per field, whether the bytes are skipped, buffered, delivered
//! as a scalar, or descended into.
//!
//! ## Algorithm Overview
//!
//! 1. A synthetic root field spanning the whole payload enters
//!    [`Traverser::scan_field`]
//! 2. Length-delimited fields ask the top visitor for a [`Treatment`]
//! 3. Visitors hand control down the chain by returning [`Handoff::Next`];
//!    the traverser pushes handed-off visitors and re-delivers the event
//!    until the chain settles (the cascading fixpoint rule)
//! 4. When a field ends, every visitor pushed inside it is popped again

pub mod wire;

use crate::error::Error;
use tracing::trace;
use wire::{CodedReader, WIRE_TYPE_FIXED32, WIRE_TYPE_FIXED64, WIRE_TYPE_LEN, WIRE_TYPE_VARINT};

/// Raw value carried by a [`FieldInfo`], tagged by encoding form.
///
/// Length-delimited fields carry only their declared length; equality on
/// this variant therefore compares lengths, with content equality handled
/// separately by whoever buffered the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldValue {
    /// Raw varint (wire type 0)
    Varint(u64),
    /// Raw little-endian 64-bit value (wire type 1)
    Fixed64(u64),
    /// Raw little-endian 32-bit value (wire type 5)
    Fixed32(u32),
    /// Declared byte length of a length-delimited field (wire type 2)
    Len(usize),
}

/// A single field event: tag number, wire type and the raw value or size
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldInfo {
    pub(crate) number: u32,
    pub(crate) wire_type: u32,
    pub(crate) value: FieldValue,
}

impl Default for FieldInfo {
    fn default() -> Self {
        Self {
            number: 0,
            wire_type: WIRE_TYPE_VARINT,
            value: FieldValue::Varint(0),
        }
    }
}

impl FieldInfo {
    /// Synthesizes the root field covering an entire payload
    pub(crate) fn root(payload_len: usize) -> Self {
        Self {
            number: 0,
            wire_type: WIRE_TYPE_LEN,
            value: FieldValue::Len(payload_len),
        }
    }

    /// Value equality: wire types must match and the stored scalar must
    /// match (declared length only, for length-delimited fields)
    pub(crate) fn value_equals(&self, other: &FieldInfo) -> bool {
        self.wire_type == other.wire_type && self.value == other.value
    }

    /// The raw value widened to 64 bits, reinterpreting as needed
    pub(crate) fn raw_u64(&self) -> u64 {
        match self.value {
            FieldValue::Varint(v) | FieldValue::Fixed64(v) => v,
            FieldValue::Fixed32(v) => v as u64,
            FieldValue::Len(n) => n as u64,
        }
    }

    /// The low 32 bits of the raw value
    pub(crate) fn raw_u32(&self) -> u32 {
        self.raw_u64() as u32
    }

    /// The declared length of a length-delimited field
    pub(crate) fn len(&self) -> usize {
        match self.value {
            FieldValue::Len(n) => n,
            _ => 0,
        }
    }
}

/// How the traverser should treat the bytes of a length-delimited field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Treatment {
    /// Advance past the bytes
    Skip,
    /// Read the bytes and deliver them via `buffered_value`
    Buffer,
    /// Read the bytes as UTF-8 and deliver via `read_string`
    AsString,
    /// Read the bytes and deliver via `read_bytes`
    AsBytes,
    /// Recurse into the bytes as a nested message
    AsSubmessage,
    /// Read back-to-back varints, delivering each as a primitive
    AsPackedVarint,
    /// Read back-to-back 32-bit values, delivering each as a primitive
    AsPacked32,
    /// Read back-to-back 64-bit values, delivering each as a primitive
    AsPacked64,
}

/// A visitor's answer to "who handles what comes next"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handoff {
    /// The current visitor keeps receiving events
    Stay,
    /// Push the next visitor in the chain above the current one
    Next,
}

/// Deferred work a visitor requests when a field ends
pub(crate) enum EndAction {
    None,
    /// Re-scan buffered bytes through the rest of the chain on a fresh
    /// stack (the map filter's key-matched value)
    Replay { field: FieldInfo, bytes: Vec<u8> },
}

/// Why a scan stopped before consuming the whole payload
#[derive(Debug)]
pub(crate) enum ScanInterrupt {
    /// The emitter reached its row limit; unwound silently by the caller
    LimitReached,
    /// The payload or the pipeline failed
    Failed(Error),
}

impl From<Error> for ScanInterrupt {
    fn from(e: Error) -> Self {
        ScanInterrupt::Failed(e)
    }
}

pub(crate) type ScanResult<T> = std::result::Result<T, ScanInterrupt>;

/// One stage of the compiled pipeline.
///
/// Every event defaults to the identity behavior: do nothing and keep the
/// current visitor. Stages that hand a region to the stage downstream
/// return [`Handoff::Next`] from `begin_field`/`begin_message`, or pair it
/// with a [`Treatment`] from `read_length_delimited`.
pub(crate) trait Visitor {
    /// Called when the traverser places this visitor on the stack
    fn pushed(&mut self) {}

    /// A field tag was read; the value follows
    fn begin_field(&mut self, number: u32, wire_type: u32) -> Handoff {
        let _ = (number, wire_type);
        Handoff::Stay
    }

    /// A wire-type 0/1/5 value, or one element of a packed run
    fn read_primitive(&mut self, field: &FieldInfo) -> ScanResult<()> {
        let _ = field;
        Ok(())
    }

    /// A wire-type 2 field: decide how its bytes are treated
    fn read_length_delimited(&mut self, field: &FieldInfo) -> (Treatment, Handoff) {
        let _ = field;
        (Treatment::Skip, Handoff::Stay)
    }

    /// Bytes requested via [`Treatment::AsString`]
    fn read_string(&mut self, value: String) -> ScanResult<()> {
        let _ = value;
        Ok(())
    }

    /// Bytes requested via [`Treatment::AsBytes`]
    fn read_bytes(&mut self, value: Vec<u8>) -> ScanResult<()> {
        let _ = value;
        Ok(())
    }

    /// Bytes requested via [`Treatment::Buffer`]
    fn buffered_value(&mut self, value: Vec<u8>) -> ScanResult<()> {
        let _ = value;
        Ok(())
    }

    /// The traverser entered a submessage
    fn begin_message(&mut self) -> Handoff {
        Handoff::Stay
    }

    /// The field begun by the matching `begin_field` ended
    fn end_field(&mut self) -> EndAction {
        EndAction::None
    }

    /// Called when the traverser removes this visitor from the stack.
    /// Also serves as the state-reset hook between runs.
    fn popped(&mut self) {}
}

struct StackEntry {
    visitor: usize,
    depth_at_push: i32,
}

/// Walks a wire stream and delivers events to the visitor chain.
///
/// The chain is positional: entry `i` hands off to entry `i + 1`. The
/// stack records which chain positions are active and at what field depth
/// each was pushed, so the unwind after a field can pop exactly the
/// visitors that field introduced.
pub(crate) struct Traverser<'c> {
    chain: &'c mut [Box<dyn Visitor>],
    stack: Vec<StackEntry>,
    depth: i32,
}

impl<'c> Traverser<'c> {
    pub(crate) fn new(chain: &'c mut [Box<dyn Visitor>]) -> Self {
        Self {
            chain,
            stack: Vec::new(),
            depth: 0,
        }
    }

    /// Index of the visitor currently receiving events
    fn current(&self) -> Option<usize> {
        self.stack.last().map(|e| e.visitor)
    }

    pub(crate) fn push(&mut self, visitor: usize) {
        trace!(visitor, depth = self.depth, "push visitor");
        debug_assert!(visitor < self.chain.len());
        self.stack.push(StackEntry {
            visitor,
            depth_at_push: self.depth,
        });
        self.chain[visitor].pushed();
    }

    pub(crate) fn pop(&mut self) {
        trace!(depth = self.depth, "pop visitor");
        if let Some(entry) = self.stack.pop() {
            self.chain[entry.visitor].popped();
        }
    }

    /// Scans one field whose tag has already been consumed.
    ///
    /// This is the entry point for the synthetic root field and the
    /// recursion point for nested submessages.
    pub(crate) fn scan_field(&mut self, field: &FieldInfo, reader: &mut CodedReader<'_>) -> ScanResult<()> {
        if field.wire_type != WIRE_TYPE_LEN {
            return self.deliver_primitive(field);
        }
        let len = field.len();

        let (treatment, handoff) = match self.current() {
            Some(i) => self.chain[i].read_length_delimited(field),
            None => (Treatment::Skip, Handoff::Stay),
        };
        trace!(?treatment, number = field.number, "length-delimited field");

        let pushed_new = handoff == Handoff::Next
            && self
                .current()
                .is_some_and(|i| i + 1 < self.chain.len());
        if pushed_new {
            let next = self.current().expect("non-empty stack") + 1;
            self.push(next);
            self.begin_field_cascade(field.number, field.wire_type);
        }

        match treatment {
            Treatment::Skip => reader.skip(len)?,
            Treatment::Buffer => {
                let bytes = reader.read_exact(len)?.to_vec();
                self.deliver_buffered_value(bytes)?;
            }
            Treatment::AsString => {
                let bytes = reader.read_exact(len)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| Error::bad_proto("string field is not valid UTF-8"))?
                    .to_owned();
                self.deliver_string(s)?;
            }
            Treatment::AsBytes => {
                let bytes = reader.read_exact(len)?.to_vec();
                self.deliver_bytes(bytes)?;
            }
            Treatment::AsSubmessage => {
                let frame = reader.incr_recursion_and_push_limit(len)?;
                self.scan_message(reader)?;
                reader.decr_recursion_and_pop_limit(frame);
            }
            Treatment::AsPackedVarint => {
                self.read_packed(reader, field.number, len, WIRE_TYPE_VARINT)?
            }
            Treatment::AsPacked32 => self.read_packed(reader, field.number, len, WIRE_TYPE_FIXED32)?,
            Treatment::AsPacked64 => self.read_packed(reader, field.number, len, WIRE_TYPE_FIXED64)?,
        }

        if pushed_new {
            self.end_field_and_unwind()?;
        }
        Ok(())
    }

    /// Reads tag/value pairs until the current limit is exhausted
    fn scan_message(&mut self, reader: &mut CodedReader<'_>) -> ScanResult<()> {
        self.begin_message_cascade();

        loop {
            let tag = reader.read_tag()?;
            if tag == 0 {
                if !reader.consumed_entire_message() {
                    return Err(Error::bad_proto("unexpected zero tag").into());
                }
                return Ok(());
            }
            let number = tag >> 3;
            let wire_type = tag & 0x7;
            let field = read_field_value(reader, number, wire_type)?;

            self.begin_field_cascade(number, wire_type);
            self.scan_field(&field, reader)?;
            self.end_field_and_unwind()?;
        }
    }

    /// Reads a packed run as a sequence of primitives of the inner wire type
    fn read_packed(
        &mut self,
        reader: &mut CodedReader<'_>,
        number: u32,
        len: usize,
        inner_wire_type: u32,
    ) -> ScanResult<()> {
        let limit = reader.push_limit(len)?;
        while reader.bytes_until_limit() > 0 {
            let field = read_field_value(reader, number, inner_wire_type)?;
            self.begin_field_cascade(number, inner_wire_type);
            self.deliver_primitive(&field)?;
            self.end_field_and_unwind()?;
        }
        reader.pop_limit(limit);
        Ok(())
    }

    /// Raises the depth, then delivers `begin_field` until the chain
    /// settles, pushing every handed-off visitor
    fn begin_field_cascade(&mut self, number: u32, wire_type: u32) {
        self.depth += 1;
        while let Some(i) = self.current() {
            match self.chain[i].begin_field(number, wire_type) {
                Handoff::Stay => break,
                Handoff::Next if i + 1 < self.chain.len() => self.push(i + 1),
                Handoff::Next => break,
            }
        }
    }

    /// Delivers `begin_message` until the chain settles
    fn begin_message_cascade(&mut self) {
        while let Some(i) = self.current() {
            match self.chain[i].begin_message() {
                Handoff::Stay => break,
                Handoff::Next if i + 1 < self.chain.len() => self.push(i + 1),
                Handoff::Next => break,
            }
        }
    }

    /// Lowers the depth, ends the field on the current visitor, then pops
    /// every stack entry pushed deeper than the new depth (ending the
    /// field on each newly exposed visitor as well)
    fn end_field_and_unwind(&mut self) -> ScanResult<()> {
        self.depth -= 1;
        self.deliver_end_field()?;
        while let Some(top) = self.stack.last() {
            if top.depth_at_push <= self.depth {
                break;
            }
            self.pop();
            self.deliver_end_field()?;
        }
        Ok(())
    }

    fn deliver_end_field(&mut self) -> ScanResult<()> {
        let Some(i) = self.current() else {
            return Ok(());
        };
        match self.chain[i].end_field() {
            EndAction::None => Ok(()),
            EndAction::Replay { field, bytes } => self.replay(i + 1, field, bytes),
        }
    }

    /// Re-scans buffered bytes through the chain starting at `start`, on a
    /// fresh stack, fresh depth and a fresh reader (fresh recursion budget)
    fn replay(&mut self, start: usize, field: FieldInfo, bytes: Vec<u8>) -> ScanResult<()> {
        trace!(start, len = bytes.len(), "replay buffered value");
        if start >= self.chain.len() {
            return Ok(());
        }
        let saved_stack = std::mem::take(&mut self.stack);
        let saved_depth = std::mem::replace(&mut self.depth, 0);

        let mut reader = CodedReader::new(&bytes);
        self.push(start);
        let outcome = self.scan_field(&field, &mut reader);
        if outcome.is_ok() {
            self.pop();
        }

        self.stack = saved_stack;
        self.depth = saved_depth;
        outcome
    }

    fn deliver_primitive(&mut self, field: &FieldInfo) -> ScanResult<()> {
        match self.current() {
            Some(i) => self.chain[i].read_primitive(field),
            None => Ok(()),
        }
    }

    fn deliver_string(&mut self, value: String) -> ScanResult<()> {
        match self.current() {
            Some(i) => self.chain[i].read_string(value),
            None => Ok(()),
        }
    }

    fn deliver_bytes(&mut self, value: Vec<u8>) -> ScanResult<()> {
        match self.current() {
            Some(i) => self.chain[i].read_bytes(value),
            None => Ok(()),
        }
    }

    fn deliver_buffered_value(&mut self, value: Vec<u8>) -> ScanResult<()> {
        match self.current() {
            Some(i) => self.chain[i].buffered_value(value),
            None => Ok(()),
        }
    }
}

/// Reads the value (or declared size) for a field of the given wire type
fn read_field_value(
    reader: &mut CodedReader<'_>,
    number: u32,
    wire_type: u32,
) -> ScanResult<FieldInfo> {
    let value = match wire_type {
        WIRE_TYPE_VARINT => FieldValue::Varint(reader.read_varint64()?),
        WIRE_TYPE_FIXED64 => FieldValue::Fixed64(reader.read_le64()?),
        WIRE_TYPE_LEN => FieldValue::Len(reader.read_varint_size()?),
        WIRE_TYPE_FIXED32 => FieldValue::Fixed32(reader.read_le32()?),
        other => {
            return Err(Error::bad_proto(format!("unsupported wire type {other}")).into());
        }
    };
    Ok(FieldInfo {
        number,
        wire_type,
        value,
    })
}
