use std::collections::BTreeMap;

use crate::error::{Result, StoreError};

/// Calculate the Fletcher32 checksum over the first `length` bytes.
///
/// If `length` is odd, a zero byte is appended for the final word.
pub fn fletcher32(bytes: &[u8], length: usize) -> u32 {
    let (mut sum1, mut sum2) = (0xffff_u32, 0xffff_u32);
    let (mut i, len) = (0, length & !1);

    assert!(len <= bytes.len(), "length exceeds byte slice bounds");

    while i < len {
        // reduce after 360 words (each word is two bytes)
        let end = std::cmp::min(i + 720, len);
        while i < end {
            let x = ((bytes[i] as u32) << 8) | (bytes[i + 1] as u32);
            i += 2;
            sum1 += x;
            sum2 += sum1;
        }
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }

    if (length & 1) != 0 {
        let x = (bytes[i] as u32) << 8;
        sum1 += x;
        sum2 += sum1;
    }

    sum1 = (sum1 & 0xffff) + (sum1 >> 16);
    sum2 = (sum2 & 0xffff) + (sum2 >> 16);

    (sum2 << 16) | sum1
}

/// 16-bit check code of a 32-bit value, used for the page check value
/// (the XOR of the chunk id, offset and length check codes).
pub fn check_value(x: u32) -> u16 {
    ((x >> 16) ^ x) as u16
}

/// Append a u32 in the 7-bits-per-byte variable length encoding.
pub fn write_var_u32(buf: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Append a u64 in the 7-bits-per-byte variable length encoding.
pub fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Read a var-encoded u32, advancing the slice.
pub fn read_var_u32(buf: &mut &[u8]) -> Result<u32> {
    let v = read_var_u64(buf)?;
    u32::try_from(v).map_err(|_| StoreError::FileCorrupt("var int out of range".into()))
}

/// Read a var-encoded u64, advancing the slice.
pub fn read_var_u64(buf: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let Some((&b, rest)) = buf.split_first() else {
            return Err(StoreError::FileCorrupt("truncated var int".into()));
        };
        *buf = rest;
        if shift >= 64 {
            return Err(StoreError::FileCorrupt("var int too long".into()));
        }
        value |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Read `n` raw bytes, advancing the slice.
pub fn read_bytes<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(StoreError::FileCorrupt(format!(
            "expected {n} bytes, got {}",
            buf.len()
        )));
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

/// Read a fixed big-endian u64, advancing the slice.
pub fn read_u64_be(buf: &mut &[u8]) -> Result<u64> {
    let bytes = read_bytes(buf, 8)?;
    Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
}

pub fn format_hex_u64(value: u64) -> String {
    format!("{value:x}")
}

pub fn parse_hex_u64(value: &str) -> Result<u64> {
    u64::from_str_radix(value, 16)
        .map_err(|_| StoreError::FileCorrupt(format!("bad hex value {value:?}")))
}

pub fn parse_hex_u32(value: &str) -> Result<u32> {
    u32::from_str_radix(value, 16)
        .map_err(|_| StoreError::FileCorrupt(format!("bad hex value {value:?}")))
}

/// Serialize a `key:value,...` header map. The Fletcher32 checksum of the
/// serialized entries is appended as the final `fletcher` entry, followed
/// by a newline.
///
/// Keys and values must not contain `,`, `:` or newlines; headers only
/// carry identifiers and hex numbers.
pub fn format_header_map(map: &BTreeMap<String, String>) -> Vec<u8> {
    let mut s = String::new();
    for (k, v) in map {
        debug_assert!(!k.contains([',', ':', '\n']) && !v.contains([',', ':', '\n']));
        if !s.is_empty() {
            s.push(',');
        }
        s.push_str(k);
        s.push(':');
        s.push_str(v);
    }
    let checksum = fletcher32(s.as_bytes(), s.len());
    if !s.is_empty() {
        s.push(',');
    }
    s.push_str(&format!("fletcher:{checksum:08x}\n"));
    s.into_bytes()
}

/// Parse a header map produced by [`format_header_map`], verifying the
/// checksum. Unknown keys are preserved in the returned map so a later
/// rewrite keeps them.
pub fn parse_header_map(bytes: &[u8]) -> Result<BTreeMap<String, String>> {
    let end = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| StoreError::FileCorrupt("header map not terminated".into()))?;
    let line = std::str::from_utf8(&bytes[..end])
        .map_err(|_| StoreError::FileCorrupt("header map not ASCII".into()))?;

    let (prefix, fletcher) = line
        .rsplit_once(",fletcher:")
        .map(|(p, f)| (p, f))
        .or_else(|| line.strip_prefix("fletcher:").map(|f| ("", f)))
        .ok_or_else(|| StoreError::FileCorrupt("header map missing checksum".into()))?;
    let expected = parse_hex_u64(fletcher)? as u32;
    let actual = fletcher32(prefix.as_bytes(), prefix.len());
    if expected != actual {
        return Err(StoreError::FileCorrupt(format!(
            "header checksum mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }

    let mut map = BTreeMap::new();
    if !prefix.is_empty() {
        for entry in prefix.split(',') {
            let (k, v) = entry.split_once(':').ok_or_else(|| {
                StoreError::FileCorrupt(format!("bad header entry {entry:?}"))
            })?;
            map.insert(k.to_string(), v.to_string());
        }
    }
    Ok(map)
}

/// Required string entry of a parsed header map.
pub fn header_str<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    map.get(key)
        .map(String::as_str)
        .ok_or_else(|| StoreError::FileCorrupt(format!("header missing key {key:?}")))
}

/// Required hex u64 entry of a parsed header map.
pub fn header_u64(map: &BTreeMap<String, String>, key: &str) -> Result<u64> {
    parse_hex_u64(header_str(map, key)?)
}

/// Required hex u32 entry of a parsed header map.
pub fn header_u32(map: &BTreeMap<String, String>, key: &str) -> Result<u32> {
    parse_hex_u32(header_str(map, key)?)
}
