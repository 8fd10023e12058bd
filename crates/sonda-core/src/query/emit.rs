//! Terminal pipeline stages: converting raw field values to result rows.
//!
//! Three emitters cover the three shapes a query can resolve to: scalar
//! leaves, enum leaves (symbolic names), and submessages (rendered as
//! canonical JSON). All of them append to a shared [`RowSink`], which
//! enforces the optional row limit by raising the limit interrupt.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use prost_reflect::{EnumDescriptor, Kind};
use tracing::trace;

use super::composite_treatment;
use crate::catalog::JsonRenderer;
use crate::error::Error;
use crate::scan::wire::{zigzag_decode32, zigzag_decode64};
use crate::scan::{FieldInfo, Handoff, ScanInterrupt, ScanResult, Treatment, Visitor};

/// Shared, ordered buffer of result rows with an optional hard cap.
///
/// The sink is shared between the terminal emitter (which appends) and the
/// query façade (which drains); execution is single-threaded, so an
/// `Rc<RefCell<_>>` is all the sharing this needs.
#[derive(Clone)]
pub(crate) struct RowSink {
    inner: Rc<RefCell<SinkState>>,
}

struct SinkState {
    rows: Vec<String>,
    limit: Option<u64>,
}

impl RowSink {
    pub(crate) fn new(limit: Option<u64>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SinkState {
                rows: Vec::new(),
                limit,
            })),
        }
    }

    /// Appends a row; signals the limit interrupt once the cap is reached
    pub(crate) fn emit(&self, row: String) -> ScanResult<()> {
        trace!(row = row.as_str(), "emit");
        let mut state = self.inner.borrow_mut();
        state.rows.push(row);
        match state.limit {
            Some(limit) if state.rows.len() as u64 >= limit => {
                trace!("row limit reached");
                Err(ScanInterrupt::LimitReached)
            }
            _ => Ok(()),
        }
    }

    /// True when the configured limit admits no rows at all
    pub(crate) fn limit_is_zero(&self) -> bool {
        self.inner.borrow().limit == Some(0)
    }

    pub(crate) fn clear(&self) {
        self.inner.borrow_mut().rows.clear();
    }

    /// Drains the accumulated rows, leaving the sink empty
    pub(crate) fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.borrow_mut().rows)
    }
}

/// Shortest decimal representation of an `f32` that parses back exactly
pub(crate) fn format_float(value: f32) -> String {
    value.to_string()
}

/// Shortest decimal representation of an `f64` that parses back exactly
pub(crate) fn format_double(value: f64) -> String {
    value.to_string()
}

/// Emits scalar leaves: numbers, bools, strings and bytes
pub(crate) struct PrimitiveEmitter {
    kind: Kind,
    sink: RowSink,
}

impl PrimitiveEmitter {
    pub(crate) fn new(kind: Kind, sink: RowSink) -> Self {
        Self { kind, sink }
    }
}

impl Visitor for PrimitiveEmitter {
    fn read_length_delimited(&mut self, _field: &FieldInfo) -> (Treatment, Handoff) {
        (composite_treatment(&self.kind), Handoff::Stay)
    }

    fn read_primitive(&mut self, field: &FieldInfo) -> ScanResult<()> {
        let row = match self.kind {
            Kind::Double => format_double(f64::from_bits(field.raw_u64())),
            Kind::Float => format_float(f32::from_bits(field.raw_u32())),
            Kind::Int64 | Kind::Sfixed64 => (field.raw_u64() as i64).to_string(),
            Kind::Uint64 | Kind::Fixed64 => field.raw_u64().to_string(),
            Kind::Int32 | Kind::Sfixed32 => (field.raw_u32() as i32).to_string(),
            Kind::Uint32 | Kind::Fixed32 => field.raw_u32().to_string(),
            Kind::Bool => (if field.raw_u64() != 0 { "true" } else { "false" }).to_string(),
            Kind::Sint32 => zigzag_decode32(field.raw_u32()).to_string(),
            Kind::Sint64 => zigzag_decode64(field.raw_u64()).to_string(),
            _ => {
                return Err(Error::bad_proto(format!(
                    "field declared {:?} but encoded as a primitive",
                    self.kind
                ))
                .into())
            }
        };
        self.sink.emit(row)
    }

    fn read_string(&mut self, value: String) -> ScanResult<()> {
        self.sink.emit(value)
    }

    fn read_bytes(&mut self, value: Vec<u8>) -> ScanResult<()> {
        let mut row = String::with_capacity(2 + value.len() * 2);
        row.push_str("\\x");
        for byte in &value {
            write!(row, "{byte:02X}").expect("writing to a String cannot fail");
        }
        self.sink.emit(row)
    }
}

/// Emits enum leaves by symbolic name, falling back to the raw number
pub(crate) struct EnumEmitter {
    desc: EnumDescriptor,
    sink: RowSink,
}

impl EnumEmitter {
    pub(crate) fn new(desc: EnumDescriptor, sink: RowSink) -> Self {
        Self { desc, sink }
    }
}

impl Visitor for EnumEmitter {
    fn read_primitive(&mut self, field: &FieldInfo) -> ScanResult<()> {
        let number = field.raw_u64();
        let row = match self.desc.get_value(number as i32) {
            Some(value) => value.name().to_string(),
            None => number.to_string(),
        };
        self.sink.emit(row)
    }
}

/// Emits submessages as canonical JSON via the catalog's renderer
pub(crate) struct MessageEmitter {
    type_url: String,
    renderer: JsonRenderer,
    sink: RowSink,
}

impl MessageEmitter {
    pub(crate) fn new(type_url: String, renderer: JsonRenderer, sink: RowSink) -> Self {
        Self {
            type_url,
            renderer,
            sink,
        }
    }
}

impl Visitor for MessageEmitter {
    fn read_length_delimited(&mut self, _field: &FieldInfo) -> (Treatment, Handoff) {
        (Treatment::Buffer, Handoff::Stay)
    }

    fn buffered_value(&mut self, value: Vec<u8>) -> ScanResult<()> {
        trace!(
            len = value.len(),
            type_url = self.type_url.as_str(),
            "render submessage as JSON"
        );
        let json = self.renderer.binary_to_json(&self.type_url, &value)?;
        self.sink.emit(json)
    }
}
