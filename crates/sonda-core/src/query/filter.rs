//! Non-terminal pipeline stages.
//!
//! Each filter narrows the field stream before handing the surviving
//! region to the stage downstream: stripping a message envelope, selecting
//! a field (optionally at one index), filtering map entries by key, or
//! enumerating all map keys or values.

use prost_reflect::Kind;
use tracing::trace;

use super::{composite_treatment, packed_treatment};
use crate::scan::{EndAction, FieldInfo, Handoff, ScanResult, Treatment, Visitor};

/// Strips one layer of message envelope: descends into a length-delimited
/// field and hands the contained fields to the next stage.
pub(crate) struct DescendIntoSubmessage;

impl Visitor for DescendIntoSubmessage {
    fn read_length_delimited(&mut self, _field: &FieldInfo) -> (Treatment, Handoff) {
        (Treatment::AsSubmessage, Handoff::Stay)
    }

    fn begin_message(&mut self) -> Handoff {
        Handoff::Next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectorState {
    Scanning,
    EmittingPacked,
    EmittingOtherComposite,
}

/// Selects occurrences of one field number, optionally at a single
/// zero-based element index.
///
/// The index counter advances on every `end_field` of the wanted number,
/// so packed and unpacked encodings of a repeated field index
/// identically.
pub(crate) struct FieldSelector {
    wanted_field: u32,
    kind: Kind,
    is_packed: bool,
    wanted_index: Option<u64>,
    state: SelectorState,
    current_field: u32,
    current_index: u64,
}

impl FieldSelector {
    pub(crate) fn new(wanted_field: u32, kind: Kind, is_packed: bool) -> Self {
        trace!(wanted_field, is_packed, "created field selector");
        Self {
            wanted_field,
            kind,
            is_packed,
            wanted_index: None,
            state: SelectorState::Scanning,
            current_field: 0,
            current_index: 0,
        }
    }

    pub(crate) fn set_wanted_index(&mut self, index: u64) {
        self.wanted_index = Some(index);
    }

    /// True when the field under the cursor is the wanted one and the
    /// element index matches (an absent wanted index matches every
    /// occurrence)
    fn should_emit_current_index(&self) -> bool {
        self.current_field == self.wanted_field
            && self
                .wanted_index
                .map_or(true, |wanted| self.current_index == wanted)
    }
}

impl Visitor for FieldSelector {
    fn begin_field(&mut self, number: u32, wire_type: u32) -> Handoff {
        self.current_field = number;
        if wire_type == 2 {
            if self.is_packed {
                self.state = SelectorState::EmittingPacked;
            } else if self.should_emit_current_index() {
                if matches!(self.kind, Kind::Message(_)) {
                    return Handoff::Next;
                }
                self.state = SelectorState::EmittingOtherComposite;
            }
        } else if self.should_emit_current_index() {
            return Handoff::Next;
        }
        Handoff::Stay
    }

    fn read_length_delimited(&mut self, _field: &FieldInfo) -> (Treatment, Handoff) {
        if self.state == SelectorState::EmittingPacked {
            (packed_treatment(&self.kind), Handoff::Stay)
        } else if self.should_emit_current_index() {
            if self.state == SelectorState::EmittingOtherComposite {
                (composite_treatment(&self.kind), Handoff::Next)
            } else {
                (composite_treatment(&self.kind), Handoff::Stay)
            }
        } else {
            (Treatment::Skip, Handoff::Stay)
        }
    }

    fn end_field(&mut self) -> EndAction {
        if self.current_field == self.wanted_field {
            self.current_index += 1;
        }
        EndAction::None
    }

    fn popped(&mut self) {
        self.state = SelectorState::Scanning;
        self.current_field = 0;
        self.current_index = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapScope {
    Outermost,
    InEntry,
    InKey,
    InValue,
}

/// Filters map entries by key.
///
/// Buffers the key and value of each entry while it streams past; when the
/// entry ends and the buffered key equals the wanted key (wire type,
/// declared length and contents), asks the traverser to replay the
/// buffered value through the rest of the chain.
pub(crate) struct MapFilter {
    wanted_key_field: FieldInfo,
    wanted_key_bytes: Vec<u8>,
    scope: MapScope,
    buffered_key_field: FieldInfo,
    buffered_key_bytes: Vec<u8>,
    buffered_value_field: FieldInfo,
    buffered_value_bytes: Vec<u8>,
}

impl MapFilter {
    pub(crate) fn new(wanted_key_field: FieldInfo, wanted_key_bytes: Vec<u8>) -> Self {
        trace!(
            wire_type = wanted_key_field.wire_type,
            "created map filter"
        );
        Self {
            wanted_key_field,
            wanted_key_bytes,
            scope: MapScope::Outermost,
            buffered_key_field: FieldInfo::default(),
            buffered_key_bytes: Vec::new(),
            buffered_value_field: FieldInfo::default(),
            buffered_value_bytes: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.scope = MapScope::Outermost;
        self.buffered_key_field = FieldInfo::default();
        self.buffered_key_bytes.clear();
        self.buffered_value_field = FieldInfo::default();
        self.buffered_value_bytes.clear();
    }
}

impl Visitor for MapFilter {
    fn begin_field(&mut self, number: u32, wire_type: u32) -> Handoff {
        if wire_type == 2 && self.scope == MapScope::Outermost {
            self.scope = MapScope::InEntry;
        } else if self.scope == MapScope::InEntry {
            // Keys are not guaranteed to precede values on the wire
            if number == 1 {
                self.scope = MapScope::InKey;
            } else if number == 2 {
                self.scope = MapScope::InValue;
            }
        }
        Handoff::Stay
    }

    fn begin_message(&mut self) -> Handoff {
        if self.scope == MapScope::Outermost {
            self.scope = MapScope::InEntry;
        }
        Handoff::Stay
    }

    fn read_primitive(&mut self, field: &FieldInfo) -> ScanResult<()> {
        match self.scope {
            MapScope::InKey => self.buffered_key_field = *field,
            MapScope::InValue => self.buffered_value_field = *field,
            _ => {}
        }
        Ok(())
    }

    fn read_length_delimited(&mut self, field: &FieldInfo) -> (Treatment, Handoff) {
        match self.scope {
            MapScope::InEntry => (Treatment::AsSubmessage, Handoff::Stay),
            MapScope::InKey => {
                self.buffered_key_field = *field;
                (Treatment::Buffer, Handoff::Stay)
            }
            MapScope::InValue => {
                self.buffered_value_field = *field;
                (Treatment::Buffer, Handoff::Stay)
            }
            MapScope::Outermost => (Treatment::Skip, Handoff::Stay),
        }
    }

    fn buffered_value(&mut self, value: Vec<u8>) -> ScanResult<()> {
        match self.scope {
            MapScope::InKey => self.buffered_key_bytes = value,
            MapScope::InValue => self.buffered_value_bytes = value,
            _ => {}
        }
        Ok(())
    }

    fn end_field(&mut self) -> EndAction {
        let entry_ended = self.scope == MapScope::InEntry;
        self.scope = match self.scope {
            MapScope::InKey | MapScope::InValue => MapScope::InEntry,
            _ => MapScope::Outermost,
        };
        if !entry_ended {
            return EndAction::None;
        }

        let matched = self.buffered_key_field.value_equals(&self.wanted_key_field)
            && self.buffered_key_bytes == self.wanted_key_bytes;
        trace!(matched, "map entry ended");
        let action = if matched {
            EndAction::Replay {
                field: self.buffered_value_field,
                bytes: std::mem::take(&mut self.buffered_value_bytes),
            }
        } else {
            EndAction::None
        };
        self.reset();
        action
    }

    fn popped(&mut self) {
        self.reset();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryScope {
    Outermost,
    InEntry,
    InWantedField,
    InUnwantedOtherField,
}

/// Enumerates every key (field 1) or every value (field 2) of a map,
/// handing each wanted subfield to the next stage
pub(crate) struct AllMapEntries {
    want_keys: bool,
    kind: Kind,
    scope: EntryScope,
}

impl AllMapEntries {
    pub(crate) fn new(want_keys: bool, kind: Kind) -> Self {
        trace!(want_keys, "created all-map-entries");
        Self {
            want_keys,
            kind,
            scope: EntryScope::Outermost,
        }
    }
}

impl Visitor for AllMapEntries {
    fn begin_field(&mut self, number: u32, _wire_type: u32) -> Handoff {
        match self.scope {
            EntryScope::Outermost => {
                self.scope = EntryScope::InEntry;
                Handoff::Stay
            }
            EntryScope::InEntry => {
                if (number == 1 && self.want_keys) || (number == 2 && !self.want_keys) {
                    self.scope = EntryScope::InWantedField;
                    Handoff::Next
                } else {
                    self.scope = EntryScope::InUnwantedOtherField;
                    Handoff::Stay
                }
            }
            _ => Handoff::Stay,
        }
    }

    fn read_length_delimited(&mut self, _field: &FieldInfo) -> (Treatment, Handoff) {
        match self.scope {
            EntryScope::InEntry => (Treatment::AsSubmessage, Handoff::Stay),
            EntryScope::InWantedField => (composite_treatment(&self.kind), Handoff::Next),
            _ => (Treatment::Skip, Handoff::Stay),
        }
    }

    fn end_field(&mut self) -> EndAction {
        self.scope = match self.scope {
            EntryScope::InWantedField | EntryScope::InUnwantedOtherField => EntryScope::InEntry,
            _ => EntryScope::Outermost,
        };
        EndAction::None
    }

    fn popped(&mut self) {
        self.scope = EntryScope::Outermost;
    }
}
