use std::collections::BTreeMap;

use crate::data_util::*;

#[test]
fn test_fletcher32_known_values() {
    assert_eq!(fletcher32(b"", 0), 0xffff_ffff);
    let data = b"hello world";
    let even = fletcher32(data, 10);
    let odd = fletcher32(data, 11);
    assert_ne!(even, odd);
    // appending an explicit zero equals the implicit odd-length pad
    let padded = b"hello world\0";
    assert_eq!(fletcher32(padded, 12), odd);
}

#[test]
fn test_check_value_folds_high_bits() {
    assert_eq!(check_value(0), 0);
    assert_eq!(check_value(0x0001_0001), 0);
    assert_eq!(check_value(0xffff_0000), 0xffff);
}

#[test]
fn test_var_int_roundtrip() {
    let values = [0u64, 1, 127, 128, 300, 0xffff, u32::MAX as u64, u64::MAX];
    for v in values {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, v);
        let mut slice = buf.as_slice();
        assert_eq!(read_var_u64(&mut slice).unwrap(), v);
        assert!(slice.is_empty());
    }
}

#[test]
fn test_var_int_rejects_truncation() {
    let mut buf = Vec::new();
    write_var_u64(&mut buf, 1 << 40);
    let mut slice = &buf[..buf.len() - 1];
    assert!(read_var_u64(&mut slice).is_err());
}

#[test]
fn test_header_map_roundtrip() {
    let mut map = BTreeMap::new();
    map.insert("chunk".to_string(), "2a".to_string());
    map.insert("version".to_string(), "5".to_string());
    let bytes = format_header_map(&map);
    assert!(bytes.ends_with(b"\n"));
    let parsed = parse_header_map(&bytes).unwrap();
    assert_eq!(parsed, map);
}

#[test]
fn test_header_map_detects_corruption() {
    let mut map = BTreeMap::new();
    map.insert("block".to_string(), "10".to_string());
    let mut bytes = format_header_map(&map);
    bytes[0] ^= 0x01;
    assert!(parse_header_map(&bytes).is_err());
}

#[test]
fn test_header_map_unknown_keys_survive() {
    let mut map = BTreeMap::new();
    map.insert("future".to_string(), "abc".to_string());
    map.insert("version".to_string(), "1".to_string());
    let parsed = parse_header_map(&format_header_map(&map)).unwrap();
    assert_eq!(parsed.get("future").unwrap(), "abc");
}

#[test]
fn test_empty_header_map() {
    let bytes = format_header_map(&BTreeMap::new());
    let parsed = parse_header_map(&bytes).unwrap();
    assert!(parsed.is_empty());
}
