//! Query compilation and execution.
//!
//! A query names a descriptor set, a root message type and a dotted path
//! into its fields:
//!
//! ```text
//! query   := [ set ':' ] message ':' path?
//! path    := part ( '.' part )*
//! part    := field_ref ( selector )?
//! field_ref := NAME | NUMBER
//! selector  := '[' index ']' | '|keys'
//! index     := '*' | NUMBER | MAP_KEY
//! ```
//!
//! The compiler resolves every segment against the catalog and lowers the
//! path into a chain of visitors: a descend stage per envelope, a field
//! selector per segment, a map stage where the segment is a map, and a
//! terminal emitter chosen by the final declared type. Running the query
//! threads a payload through the chain and collects the emitted rows.
//!
//! An empty path emits the whole message as JSON, so
//! `Query::new(&catalog, "ex.M:", None)` doubles as a binary-to-JSON
//! conversion.

mod emit;
mod filter;

use prost_reflect::{FieldDescriptor, Kind, MessageDescriptor};
use tracing::debug;

use crate::catalog::{type_url_for, Catalog, DescSet, JsonRenderer, DEFAULT_SET_NAME};
use crate::error::{Error, Result};
use crate::scan::wire::{
    zigzag_encode32, zigzag_encode64, CodedReader, WIRE_TYPE_FIXED32, WIRE_TYPE_FIXED64,
    WIRE_TYPE_LEN, WIRE_TYPE_VARINT,
};
use crate::scan::{FieldInfo, FieldValue, ScanInterrupt, Traverser, Treatment, Visitor};
use emit::{EnumEmitter, MessageEmitter, PrimitiveEmitter, RowSink};
use filter::{AllMapEntries, DescendIntoSubmessage, FieldSelector, MapFilter};

/// The wire type a declared field type encodes as
pub(crate) fn wire_type_for(kind: &Kind) -> u32 {
    match kind {
        Kind::Double | Kind::Fixed64 | Kind::Sfixed64 => WIRE_TYPE_FIXED64,
        Kind::Float | Kind::Fixed32 | Kind::Sfixed32 => WIRE_TYPE_FIXED32,
        Kind::String | Kind::Bytes | Kind::Message(_) => WIRE_TYPE_LEN,
        _ => WIRE_TYPE_VARINT,
    }
}

/// Treatment for a length-delimited field of the given declared type
pub(crate) fn composite_treatment(kind: &Kind) -> Treatment {
    match kind {
        Kind::Message(_) => Treatment::AsSubmessage,
        Kind::String => Treatment::AsString,
        Kind::Bytes => Treatment::AsBytes,
        _ => Treatment::Skip,
    }
}

/// Treatment for a packed run of the given declared element type
pub(crate) fn packed_treatment(kind: &Kind) -> Treatment {
    match wire_type_for(kind) {
        WIRE_TYPE_VARINT => Treatment::AsPackedVarint,
        WIRE_TYPE_FIXED64 => Treatment::AsPacked64,
        WIRE_TYPE_FIXED32 => Treatment::AsPacked32,
        _ => Treatment::Skip,
    }
}

/// The compiler's running view of what the next path segment reads
struct Cursor {
    kind: Kind,
    is_repeated: bool,
    is_map: bool,
}

/// A compiled query: a visitor chain plus the row sink it feeds.
///
/// Compilation resolves the full path against the catalog up front, so
/// every failure a query text can cause surfaces from [`Query::new`]; a
/// constructed query only fails on payload problems. A query may be reused
/// across payloads.
pub struct Query {
    chain: Vec<Box<dyn Visitor>>,
    sink: RowSink,
}

impl Query {
    /// Compiles a query against a catalog.
    ///
    /// `limit`, when set, caps the number of result rows; the scan stops
    /// early once the cap is reached.
    pub fn new(catalog: &Catalog, text: &str, limit: Option<u64>) -> Result<Self> {
        let sink = RowSink::new(limit);

        let (set_name, rest) = split_set(text);
        let set = catalog
            .get_set(set_name)
            .ok_or_else(|| Error::bad_query(format!("descriptor set not found: {set_name}")))?;
        let (root, path) = split_root_message(set, rest)?;
        debug!(set = set_name, root = root.full_name(), path, "compiling query");

        let mut cursor = Cursor {
            kind: Kind::Message(root),
            is_repeated: false,
            is_map: false,
        };
        let mut chain: Vec<Box<dyn Visitor>> = Vec::new();

        if !path.is_empty() {
            // Strip the root envelope once; an empty path instead hands
            // the whole payload to the emitter.
            chain.push(Box::new(DescendIntoSubmessage));
            for (i, part) in path.split('.').enumerate() {
                if i > 0 {
                    chain.push(Box::new(DescendIntoSubmessage));
                }
                compile_part(part, &mut cursor, &mut chain)?;
                debug!(part, visitors = chain.len(), "query part compiled");
            }
        }

        chain.push(new_emitter(&cursor, set.json_renderer(), sink.clone()));
        Ok(Self { chain, sink })
    }

    /// Runs the query over one payload, returning the rows in wire order.
    ///
    /// The payload must be a valid encoding of the query's root message
    /// type. A configured limit of zero yields no rows without reading the
    /// payload at all.
    pub fn run(&mut self, payload: &[u8]) -> Result<Vec<String>> {
        if self.sink.limit_is_zero() {
            return Ok(Vec::new());
        }
        // A previous run that stopped early may have left visitor state
        // behind; start from a clean slate.
        self.sink.clear();
        for visitor in &mut self.chain {
            visitor.popped();
        }

        let mut reader = CodedReader::new(payload);
        let mut traverser = Traverser::new(&mut self.chain);
        traverser.push(0);
        let root = FieldInfo::root(payload.len());
        match traverser.scan_field(&root, &mut reader) {
            Ok(()) => traverser.pop(),
            Err(ScanInterrupt::LimitReached) => {}
            Err(ScanInterrupt::Failed(e)) => {
                self.sink.clear();
                return Err(e);
            }
        }
        Ok(self.sink.take())
    }
}

/// Splits the optional descriptor-set prefix.
///
/// The prefix before the first `:` names a set iff a second `:` occurs
/// later in the query; otherwise the whole text belongs to the default
/// set.
fn split_set(text: &str) -> (&str, &str) {
    if let Some(i) = text.find(':') {
        if text[i + 1..].contains(':') {
            return (&text[..i], &text[i + 1..]);
        }
    }
    (DEFAULT_SET_NAME, text)
}

/// Resolves the root message name and returns it with the remaining path
fn split_root_message<'q>(set: &DescSet, rest: &'q str) -> Result<(MessageDescriptor, &'q str)> {
    let colon = rest.find(':').ok_or_else(|| {
        Error::bad_query("expected a query of the form [<descriptor_set>:]<message_name>:<path>")
    })?;
    let name = &rest[..colon];
    let root = set.find_message(name).ok_or_else(|| {
        Error::bad_query(format!(
            "unknown message type: {name} (did you include the package name?)"
        ))
    })?;
    Ok((root, &rest[colon + 1..]))
}

/// Compiles one `field[selector]` segment, appending its visitors and
/// advancing the cursor to the type the next segment reads
fn compile_part(part: &str, cursor: &mut Cursor, chain: &mut Vec<Box<dyn Visitor>>) -> Result<()> {
    if part.is_empty() {
        return Err(Error::bad_query("unexpected empty query part"));
    }
    let Kind::Message(parent) = cursor.kind.clone() else {
        return Err(Error::bad_query(format!(
            "query does not refer to a known field: {part}"
        )));
    };

    let selector_start = part
        .find(|c| c == '[' || c == '|')
        .unwrap_or(part.len());
    let (field_ref, selector) = part.split_at(selector_start);

    let fd = resolve_field(&parent, field_ref, part)?;
    cursor.is_repeated = fd.is_list() || fd.is_map();
    cursor.is_map = fd.is_map();
    cursor.kind = fd.kind();

    if !cursor.is_repeated && !selector.is_empty() {
        return Err(Error::bad_query(
            "non-repeated field must not be followed by an array/map selector",
        ));
    }

    let mut field_selector = FieldSelector::new(fd.number(), fd.kind(), fd.is_packed());

    if !cursor.is_repeated {
        chain.push(Box::new(field_selector));
        return Ok(());
    }

    let bracketed = selector.len() >= 2 && selector.starts_with('[') && selector.ends_with(']');
    let keys_selector = selector == "|keys";
    if !bracketed && !keys_selector {
        return Err(Error::bad_query(
            "repeated field must be followed by an array/map selector like '[*]', \
             or '|keys' (for maps)",
        ));
    }
    let index = if bracketed {
        let inner = &selector[1..selector.len() - 1];
        if inner.is_empty() {
            return Err(Error::bad_query(
                "empty array/map selector '[]' is invalid - did you mean '[*]'?",
            ));
        }
        inner
    } else {
        ""
    };
    if keys_selector && !cursor.is_map {
        return Err(Error::bad_query("'|keys' can only be used on maps"));
    }

    if cursor.is_map {
        let Kind::Message(entry) = fd.kind() else {
            return Err(Error::bad_proto("invalid map field"));
        };
        let key_field = entry.map_entry_key_field();
        let value_field = entry.map_entry_value_field();

        chain.push(Box::new(field_selector));
        if keys_selector {
            cursor.kind = key_field.kind();
            chain.push(Box::new(AllMapEntries::new(true, key_field.kind())));
        } else if index == "*" {
            cursor.kind = value_field.kind();
            chain.push(Box::new(AllMapEntries::new(false, value_field.kind())));
        } else {
            cursor.kind = value_field.kind();
            let (wanted_field, wanted_bytes) = parse_map_key(index, &key_field.kind())?;
            chain.push(Box::new(MapFilter::new(wanted_field, wanted_bytes)));
        }
    } else {
        if index != "*" {
            let n: u64 = index.parse().map_err(|_| {
                Error::bad_query(format!("expected numeric indexer at: {index}"))
            })?;
            field_selector.set_wanted_index(n);
        }
        chain.push(Box::new(field_selector));
    }
    Ok(())
}

/// Resolves a field by name, or by number when the reference is numeric
fn resolve_field(parent: &MessageDescriptor, field_ref: &str, part: &str) -> Result<FieldDescriptor> {
    let fd = if field_ref.starts_with(|c: char| c.is_ascii_digit()) {
        let number: u32 = field_ref
            .parse()
            .map_err(|_| Error::bad_query(format!("invalid field number in query: {part}")))?;
        parent.get_field(number)
    } else {
        parent.get_field_by_name(field_ref)
    };
    fd.ok_or_else(|| {
        Error::bad_query(format!(
            "field not found: {part} in {}",
            parent.full_name()
        ))
    })
}

/// Parses a map-key literal into the exact wire shape of the entry's key
/// field: wire type, raw value (sign-extended or zigzag-encoded the way
/// the wire carries it) and, for string keys, the content bytes.
fn parse_map_key(literal: &str, key_kind: &Kind) -> Result<(FieldInfo, Vec<u8>)> {
    let mut bytes = Vec::new();
    let value = match key_kind {
        Kind::String => {
            bytes = literal.as_bytes().to_vec();
            FieldValue::Len(literal.len())
        }
        Kind::Int32 => FieldValue::Varint(parse_num::<i32>(literal)? as i64 as u64),
        Kind::Int64 => FieldValue::Varint(parse_num::<i64>(literal)? as u64),
        Kind::Uint32 => FieldValue::Varint(parse_num::<u32>(literal)? as u64),
        Kind::Uint64 => FieldValue::Varint(parse_num::<u64>(literal)?),
        Kind::Sint32 => FieldValue::Varint(zigzag_encode32(parse_num::<i32>(literal)?) as u64),
        Kind::Sint64 => FieldValue::Varint(zigzag_encode64(parse_num::<i64>(literal)?)),
        Kind::Fixed32 => FieldValue::Fixed32(parse_num::<u32>(literal)?),
        Kind::Fixed64 => FieldValue::Fixed64(parse_num::<u64>(literal)?),
        Kind::Sfixed32 => FieldValue::Fixed32(parse_num::<i32>(literal)? as u32),
        Kind::Sfixed64 => FieldValue::Fixed64(parse_num::<i64>(literal)? as u64),
        Kind::Bool => match literal {
            "true" => FieldValue::Varint(1),
            "false" => FieldValue::Varint(0),
            _ => {
                return Err(Error::bad_query(format!(
                    "invalid boolean map key: {literal}"
                )))
            }
        },
        other => {
            return Err(Error::bad_query(format!(
                "unrecognized map key type: {other:?}"
            )))
        }
    };
    Ok((
        FieldInfo {
            number: 1,
            wire_type: wire_type_for(key_kind),
            value,
        },
        bytes,
    ))
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::bad_query(format!("invalid numeric key: {s}")))
}

/// Builds the terminal emitter for the query's final declared type
fn new_emitter(cursor: &Cursor, renderer: JsonRenderer, sink: RowSink) -> Box<dyn Visitor> {
    match &cursor.kind {
        Kind::Message(desc) => Box::new(MessageEmitter::new(
            type_url_for(desc.full_name()),
            renderer,
            sink,
        )),
        Kind::Enum(desc) => Box::new(EnumEmitter::new(desc.clone(), sink)),
        kind => Box::new(PrimitiveEmitter::new(kind.clone(), sink)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
        MessageOptions,
    };

    fn field(
        name: &str,
        number: i32,
        ty: Type,
        label: Label,
        type_name: Option<&str>,
    ) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.into()),
            number: Some(number),
            label: Some(label as i32),
            r#type: Some(ty as i32),
            type_name: type_name.map(Into::into),
            json_name: Some(name.into()),
            ..Default::default()
        }
    }

    /// package ex; message M { string s=1; repeated int32 r=2; map<string,int32> mp=3; }
    fn test_catalog() -> Catalog {
        let map_entry = DescriptorProto {
            name: Some("MpEntry".into()),
            field: vec![
                field("key", 1, Type::String, Label::Optional, None),
                field("value", 2, Type::Int32, Label::Optional, None),
            ],
            options: Some(MessageOptions {
                map_entry: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let m = DescriptorProto {
            name: Some("M".into()),
            field: vec![
                field("s", 1, Type::String, Label::Optional, None),
                field("r", 2, Type::Int32, Label::Repeated, None),
                field("mp", 3, Type::Message, Label::Repeated, Some(".ex.M.MpEntry")),
            ],
            nested_type: vec![map_entry],
            ..Default::default()
        };
        let fds = FileDescriptorSet {
            file: vec![FileDescriptorProto {
                name: Some("ex.proto".into()),
                package: Some("ex".into()),
                syntax: Some("proto3".into()),
                message_type: vec![m],
                ..Default::default()
            }],
        };
        let mut catalog = Catalog::new();
        catalog
            .add_set_bytes("default", &fds.encode_to_vec())
            .unwrap();
        catalog
    }

    fn bad_query(catalog: &Catalog, text: &str) -> String {
        match Query::new(catalog, text, None) {
            Err(Error::BadQuery { detail }) => detail,
            Err(other) => panic!("expected BadQuery for {text:?}, got {other:?}"),
            Ok(_) => panic!("expected BadQuery for {text:?}, got a compiled query"),
        }
    }

    #[test]
    fn test_split_set() {
        assert_eq!(split_set("ex.M:s"), ("default", "ex.M:s"));
        assert_eq!(split_set("mine:ex.M:s"), ("mine", "ex.M:s"));
        assert_eq!(split_set("no colons"), ("default", "no colons"));
    }

    #[test]
    fn test_compiles_valid_queries() {
        let catalog = test_catalog();
        for text in [
            "ex.M:s",
            "ex.M:",
            "ex.M:1",
            "ex.M:r[*]",
            "ex.M:r[2]",
            "ex.M:mp[a]",
            "ex.M:mp[*]",
            "ex.M:mp|keys",
            "default:ex.M:s",
        ] {
            Query::new(&catalog, text, None).unwrap_or_else(|e| panic!("{text}: {e}"));
        }
    }

    #[test]
    fn test_unknown_set_and_message() {
        let catalog = test_catalog();
        assert!(bad_query(&catalog, "other:ex.M:s").contains("descriptor set not found"));
        assert!(bad_query(&catalog, "ex.Nope:s").contains("unknown message type"));
        assert!(bad_query(&catalog, "ex.M").contains("expected a query of the form"));
    }

    #[test]
    fn test_field_resolution_errors() {
        let catalog = test_catalog();
        assert!(bad_query(&catalog, "ex.M:zz").contains("field not found"));
        assert!(bad_query(&catalog, "ex.M:9").contains("field not found"));
        assert!(bad_query(&catalog, "ex.M:1x[*]").contains("invalid field number"));
        assert!(bad_query(&catalog, "ex.M:s.t").contains("does not refer to a known field"));
        assert!(bad_query(&catalog, "ex.M:s..").contains("empty query part"));
    }

    #[test]
    fn test_selector_rules() {
        let catalog = test_catalog();
        assert!(bad_query(&catalog, "ex.M:s[0]").contains("non-repeated field"));
        assert!(bad_query(&catalog, "ex.M:r").contains("must be followed by"));
        assert!(bad_query(&catalog, "ex.M:r[]").contains("empty array/map selector"));
        assert!(bad_query(&catalog, "ex.M:r[x]").contains("expected numeric indexer"));
        assert!(bad_query(&catalog, "ex.M:r|keys").contains("only be used on maps"));
        assert!(bad_query(&catalog, "ex.M:mp[*").contains("must be followed by"));
    }

    #[test]
    fn test_parse_map_key_shapes() {
        let (info, bytes) = parse_map_key("ab", &Kind::String).unwrap();
        assert_eq!(info.wire_type, WIRE_TYPE_LEN);
        assert_eq!(info.value, FieldValue::Len(2));
        assert_eq!(bytes, b"ab");

        // Negative 32-bit keys sign-extend to the varint domain
        let (info, _) = parse_map_key("-5", &Kind::Int32).unwrap();
        assert_eq!(info.value, FieldValue::Varint((-5i64) as u64));

        let (info, _) = parse_map_key("-3", &Kind::Sint32).unwrap();
        assert_eq!(info.value, FieldValue::Varint(5));

        let (info, _) = parse_map_key("7", &Kind::Fixed32).unwrap();
        assert_eq!(info.wire_type, WIRE_TYPE_FIXED32);
        assert_eq!(info.value, FieldValue::Fixed32(7));

        let (info, _) = parse_map_key("true", &Kind::Bool).unwrap();
        assert_eq!(info.value, FieldValue::Varint(1));
        assert!(parse_map_key("yes", &Kind::Bool).is_err());
        assert!(parse_map_key("12x", &Kind::Uint32).is_err());
    }
}
