//! End-to-end query scenarios over a hand-built descriptor set.
//!
//! Payloads are encoded by hand at the wire level so the tests control the
//! exact byte layout (entry order, packed vs unpacked encoding, unknown
//! fields, malformed data).

use prost::Message;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, FileDescriptorSet, MessageOptions,
};
use sonda_core::{Catalog, Error, Query};

// ---------------------------------------------------------------------------
// Schema: package ex
//
//   enum Color { COLOR_UNSPECIFIED = 0; RED = 1; GREEN = 2; }
//   message N { int32 x = 1; }
//   message M {
//     string s = 1;
//     repeated int32 r = 2;          // packed by default in proto3
//     map<string, int32> mp = 3;
//     N sub = 4;
//     Color c = 5;
//     bytes b = 6;
//     repeated string names = 7;
//     map<int32, string> im = 8;
//     repeated N subs = 9;
//     map<string, N> mn = 10;
//     double d = 11;
//   }
// ---------------------------------------------------------------------------

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

fn map_entry(name: &str, key: FieldDescriptorProto, value: FieldDescriptorProto) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.into()),
        field: vec![key, value],
        options: Some(MessageOptions {
            map_entry: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn test_descriptor_set() -> FileDescriptorSet {
    let color = EnumDescriptorProto {
        name: Some("Color".into()),
        value: vec![
            EnumValueDescriptorProto {
                name: Some("COLOR_UNSPECIFIED".into()),
                number: Some(0),
                ..Default::default()
            },
            EnumValueDescriptorProto {
                name: Some("RED".into()),
                number: Some(1),
                ..Default::default()
            },
            EnumValueDescriptorProto {
                name: Some("GREEN".into()),
                number: Some(2),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let n = DescriptorProto {
        name: Some("N".into()),
        field: vec![field("x", 1, Type::Int32, Label::Optional, None)],
        ..Default::default()
    };
    let m = DescriptorProto {
        name: Some("M".into()),
        field: vec![
            field("s", 1, Type::String, Label::Optional, None),
            field("r", 2, Type::Int32, Label::Repeated, None),
            field("mp", 3, Type::Message, Label::Repeated, Some(".ex.M.MpEntry")),
            field("sub", 4, Type::Message, Label::Optional, Some(".ex.N")),
            field("c", 5, Type::Enum, Label::Optional, Some(".ex.Color")),
            field("b", 6, Type::Bytes, Label::Optional, None),
            field("names", 7, Type::String, Label::Repeated, None),
            field("im", 8, Type::Message, Label::Repeated, Some(".ex.M.ImEntry")),
            field("subs", 9, Type::Message, Label::Repeated, Some(".ex.N")),
            field("mn", 10, Type::Message, Label::Repeated, Some(".ex.M.MnEntry")),
            field("d", 11, Type::Double, Label::Optional, None),
        ],
        nested_type: vec![
            map_entry(
                "MpEntry",
                field("key", 1, Type::String, Label::Optional, None),
                field("value", 2, Type::Int32, Label::Optional, None),
            ),
            map_entry(
                "ImEntry",
                field("key", 1, Type::Int32, Label::Optional, None),
                field("value", 2, Type::String, Label::Optional, None),
            ),
            map_entry(
                "MnEntry",
                field("key", 1, Type::String, Label::Optional, None),
                field("value", 2, Type::Message, Label::Optional, Some(".ex.N")),
            ),
        ],
        ..Default::default()
    };
    FileDescriptorSet {
        file: vec![FileDescriptorProto {
            name: Some("ex.proto".into()),
            package: Some("ex".into()),
            syntax: Some("proto3".into()),
            message_type: vec![m, n],
            enum_type: vec![color],
            ..Default::default()
        }],
    }
}

fn catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog
        .add_set_bytes("default", &test_descriptor_set().encode_to_vec())
        .expect("test descriptor set is well-formed");
    catalog
}

fn rows(query: &str, payload: &[u8]) -> Vec<String> {
    let catalog = catalog();
    let mut query = Query::new(&catalog, query, None).expect("query compiles");
    query.run(payload).expect("payload scans")
}

// Wire-level encoding helpers

fn varint(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

fn tag(number: u32, wire_type: u32) -> Vec<u8> {
    varint(((number << 3) | wire_type) as u64)
}

fn field_varint(number: u32, v: u64) -> Vec<u8> {
    let mut out = tag(number, 0);
    out.extend(varint(v));
    out
}

fn field_len(number: u32, bytes: &[u8]) -> Vec<u8> {
    let mut out = tag(number, 2);
    out.extend(varint(bytes.len() as u64));
    out.extend_from_slice(bytes);
    out
}

fn field_fixed64(number: u32, v: u64) -> Vec<u8> {
    let mut out = tag(number, 1);
    out.extend(v.to_le_bytes());
    out
}

/// Sign-extends the way protobuf encodes negative int32 values
fn int32_varint(v: i32) -> u64 {
    v as i64 as u64
}

fn string_entry(key: &str, value: u64) -> Vec<u8> {
    let mut entry = field_len(1, key.as_bytes());
    entry.extend(field_varint(2, value));
    entry
}

#[test]
fn top_level_scalar() {
    let payload = field_len(1, b"hi");
    assert_eq!(rows("ex.M:s", &payload), vec!["hi"]);
}

#[test]
fn absent_field_yields_no_rows() {
    let payload = field_len(1, b"hi");
    assert!(rows("ex.M:b", &payload).is_empty());
    assert!(rows("ex.M:s", &[]).is_empty());
}

#[test]
fn zero_length_string_yields_empty_row() {
    let payload = field_len(1, b"");
    assert_eq!(rows("ex.M:s", &payload), vec![""]);
}

#[test]
fn packed_repeated_index_and_star() {
    let payload = field_len(2, &[10, 20, 30]);
    assert_eq!(rows("ex.M:r[1]", &payload), vec!["20"]);
    assert_eq!(rows("ex.M:r[*]", &payload), vec!["10", "20", "30"]);
    assert!(rows("ex.M:r[5]", &payload).is_empty());
}

#[test]
fn packed_and_unpacked_encodings_agree() {
    let packed = field_len(2, &[10, 20, 30]);
    let mut unpacked = field_varint(2, 10);
    unpacked.extend(field_varint(2, 20));
    unpacked.extend(field_varint(2, 30));

    for query in ["ex.M:r[*]", "ex.M:r[1]"] {
        assert_eq!(rows(query, &packed), rows(query, &unpacked), "{query}");
    }
}

#[test]
fn star_is_concatenation_of_indices() {
    let payload = field_len(2, &[10, 20, 30]);
    let mut concatenated = Vec::new();
    for i in 0..3 {
        concatenated.extend(rows(&format!("ex.M:r[{i}]"), &payload));
    }
    assert_eq!(rows("ex.M:r[*]", &payload), concatenated);
}

#[test]
fn map_key_lookup() {
    let mut payload = field_len(3, &string_entry("a", 1));
    payload.extend(field_len(3, &string_entry("b", 2)));

    assert_eq!(rows("ex.M:mp[b]", &payload), vec!["2"]);
    assert!(rows("ex.M:mp[c]", &payload).is_empty());
    assert_eq!(rows("ex.M:mp|keys", &payload), vec!["a", "b"]);
    assert_eq!(rows("ex.M:mp[*]", &payload), vec!["1", "2"]);
}

#[test]
fn map_entry_value_before_key() {
    // Nothing guarantees keys precede values on the wire
    let mut entry = field_varint(2, 9);
    entry.extend(field_len(1, b"k"));
    let payload = field_len(3, &entry);
    assert_eq!(rows("ex.M:mp[k]", &payload), vec!["9"]);
}

#[test]
fn map_key_prefix_does_not_match() {
    // Length is part of key equality: "ab" must not match wanted key "a"
    let payload = field_len(3, &string_entry("ab", 3));
    assert!(rows("ex.M:mp[a]", &payload).is_empty());
}

#[test]
fn empty_map_yields_no_keys() {
    assert!(rows("ex.M:mp|keys", &[]).is_empty());
}

#[test]
fn numeric_map_keys_sign_extend() {
    let mut one = field_varint(1, int32_varint(1));
    one.extend(field_len(2, b"one"));
    let mut neg = field_varint(1, int32_varint(-2));
    neg.extend(field_len(2, b"neg"));
    let mut payload = field_len(8, &one);
    payload.extend(field_len(8, &neg));

    assert_eq!(rows("ex.M:im[1]", &payload), vec!["one"]);
    assert_eq!(rows("ex.M:im[-2]", &payload), vec!["neg"]);
    assert!(rows("ex.M:im[3]", &payload).is_empty());
}

#[test]
fn submessage_as_json() {
    let payload = field_len(4, &field_varint(1, 7));
    assert_eq!(rows("ex.M:sub", &payload), vec!["{\"x\":7}"]);
}

#[test]
fn nested_path() {
    let payload = field_len(4, &field_varint(1, 7));
    assert_eq!(rows("ex.M:sub.x", &payload), vec!["7"]);
}

#[test]
fn empty_path_renders_whole_message() {
    let payload = field_len(4, &field_varint(1, 7));
    assert_eq!(rows("ex.M:", &payload), vec!["{\"sub\":{\"x\":7}}"]);
}

#[test]
fn enum_values_by_name_or_number() {
    assert_eq!(rows("ex.M:c", &field_varint(5, 2)), vec!["GREEN"]);
    // Out-of-range numbers fall back to decimal
    assert_eq!(rows("ex.M:c", &field_varint(5, 99)), vec!["99"]);
}

#[test]
fn bytes_render_as_hex() {
    let payload = field_len(6, &[0xDE, 0xAD, 0x00]);
    assert_eq!(rows("ex.M:b", &payload), vec!["\\xDEAD00"]);
}

#[test]
fn repeated_string_index() {
    let mut payload = field_len(7, b"x");
    payload.extend(field_len(7, b"y"));
    assert_eq!(rows("ex.M:names[1]", &payload), vec!["y"]);
    assert_eq!(rows("ex.M:names[*]", &payload), vec!["x", "y"]);
}

#[test]
fn repeated_submessages() {
    let mut payload = field_len(9, &field_varint(1, 1));
    payload.extend(field_len(9, &field_varint(1, 2)));
    assert_eq!(
        rows("ex.M:subs[*]", &payload),
        vec!["{\"x\":1}", "{\"x\":2}"]
    );
    assert_eq!(rows("ex.M:subs[0]", &payload), vec!["{\"x\":1}"]);
    assert_eq!(rows("ex.M:subs[1].x", &payload), vec!["2"]);
}

#[test]
fn map_with_message_values() {
    let mut entry = field_len(1, b"k");
    entry.extend(field_len(2, &field_varint(1, 5)));
    let payload = field_len(10, &entry);
    assert_eq!(rows("ex.M:mn[k]", &payload), vec!["{\"x\":5}"]);
    assert_eq!(rows("ex.M:mn[*]", &payload), vec!["{\"x\":5}"]);
    assert_eq!(rows("ex.M:mn[k].x", &payload), vec!["5"]);
}

#[test]
fn double_field() {
    let payload = field_fixed64(11, 2.5f64.to_bits());
    assert_eq!(rows("ex.M:d", &payload), vec!["2.5"]);
}

#[test]
fn field_by_number() {
    let payload = field_len(1, b"hi");
    assert_eq!(rows("ex.M:1", &payload), vec!["hi"]);
}

#[test]
fn named_descriptor_set() {
    let mut catalog = Catalog::new();
    catalog
        .add_set_bytes("alt", &test_descriptor_set().encode_to_vec())
        .unwrap();
    let payload = field_len(1, b"hi");
    let mut query = Query::new(&catalog, "alt:ex.M:s", None).unwrap();
    assert_eq!(query.run(&payload).unwrap(), vec!["hi"]);
    // No set named "default" was registered
    assert!(matches!(
        Query::new(&catalog, "ex.M:s", None),
        Err(Error::BadQuery { .. })
    ));
}

#[test]
fn limit_caps_rows() {
    let catalog = catalog();
    let payload = field_len(2, &[10, 20, 30]);
    let mut query = Query::new(&catalog, "ex.M:r[*]", Some(2)).unwrap();
    assert_eq!(query.run(&payload).unwrap(), vec!["10", "20"]);
}

#[test]
fn limit_zero_reads_nothing() {
    let catalog = catalog();
    let mut query = Query::new(&catalog, "ex.M:s", Some(0)).unwrap();
    // Even a malformed payload is acceptable: it is never read
    assert!(query.run(&[0xFF]).unwrap().is_empty());
}

#[test]
fn query_reuse_is_deterministic() {
    let catalog = catalog();
    let payload = field_len(2, &[10, 20, 30]);
    let mut query = Query::new(&catalog, "ex.M:r[*]", None).unwrap();
    let first = query.run(&payload).unwrap();
    let second = query.run(&payload).unwrap();
    assert_eq!(first, second);
}

#[test]
fn query_reuse_after_limit_interrupt() {
    let catalog = catalog();
    let payload = field_len(2, &[10, 20, 30]);
    let mut query = Query::new(&catalog, "ex.M:r[*]", Some(1)).unwrap();
    assert_eq!(query.run(&payload).unwrap(), vec!["10"]);
    // The interrupted run must not leak element-index state into this one
    assert_eq!(query.run(&payload).unwrap(), vec!["10"]);
}

#[test]
fn truncated_payload_is_bad_proto() {
    // Tag promises a varint that never arrives
    let err = {
        let catalog = catalog();
        let mut query = Query::new(&catalog, "ex.M:s", None).unwrap();
        query.run(&[0x08]).unwrap_err()
    };
    assert!(matches!(err, Error::BadProto { .. }));
}

#[test]
fn group_wire_type_is_bad_proto() {
    let catalog = catalog();
    let mut query = Query::new(&catalog, "ex.M:s", None).unwrap();
    // Field 1, wire type 3 (start group)
    let err = query.run(&[0x0B]).unwrap_err();
    assert!(matches!(err, Error::BadProto { .. }));
}

#[test]
fn overlong_declared_length_is_bad_proto() {
    let catalog = catalog();
    let mut query = Query::new(&catalog, "ex.M:s", None).unwrap();
    // Field 1 claims 5 bytes but only 2 follow
    let err = query.run(&[0x0A, 0x05, b'h', b'i']).unwrap_err();
    assert!(matches!(err, Error::BadProto { .. }));
}

#[test]
fn deep_nesting_inside_map_entry_hits_recursion_limit() {
    // A map query descends into every submessage of each entry looking for
    // keys and values; 150 levels of unknown nested fields exhaust the
    // reader's recursion budget of 100.
    let mut junk = Vec::new();
    for _ in 0..150 {
        junk = field_len(3, &junk);
    }
    let payload = field_len(3, &junk);

    let catalog = catalog();
    let mut query = Query::new(&catalog, "ex.M:mp[a]", None).unwrap();
    let err = query.run(&payload).unwrap_err();
    assert!(matches!(err, Error::RecursionDepthExceeded { .. }));
}

#[test]
fn wire_type_mismatch_is_skipped() {
    // Field 1 is declared string but arrives as a varint-typed primitive:
    // the emitter rejects the mismatched primitive
    let catalog = catalog();
    let mut query = Query::new(&catalog, "ex.M:s", None).unwrap();
    assert!(query.run(&field_varint(1, 7)).is_err());
    // Declared int32 arriving length-delimited is skipped instead
    let mut query = Query::new(&catalog, "ex.M:r[*]", None).unwrap();
    let payload = field_len(4, &field_varint(1, 7));
    assert!(query.run(&payload).unwrap().is_empty());
}
