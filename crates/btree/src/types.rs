use std::cmp::Ordering;

use storage::data_util::{read_bytes, read_var_u64, write_var_u64};
use storage::{Result, StoreError};

/// Comparator and serializer for one key or value type.
///
/// Maps are generic over the key and value type through this trait; the
/// instances are supplied when the map is opened. `type_name` is recorded
/// in the map configuration so a reopen with different types is rejected.
pub trait DataType: Clone + Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    fn compare(&self, a: &Self::Value, b: &Self::Value) -> Ordering;

    /// Estimated in-memory size in bytes, for page-split and cache
    /// accounting.
    fn memory(&self, value: &Self::Value) -> usize;

    fn write(&self, buf: &mut Vec<u8>, value: &Self::Value);

    fn read(&self, buf: &mut &[u8]) -> Result<Self::Value>;

    fn type_name(&self) -> &'static str;

    fn equals(&self, a: &Self::Value, b: &Self::Value) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

/// UTF-8 strings, length-prefixed.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringType;

impl DataType for StringType {
    type Value = String;

    fn compare(&self, a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, value: &String) -> usize {
        24 + value.len()
    }

    fn write(&self, buf: &mut Vec<u8>, value: &String) {
        write_var_u64(buf, value.len() as u64);
        buf.extend_from_slice(value.as_bytes());
    }

    fn read(&self, buf: &mut &[u8]) -> Result<String> {
        let len = read_var_u64(buf)? as usize;
        let bytes = read_bytes(buf, len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::FileCorrupt("invalid UTF-8 in string value".into()))
    }

    fn type_name(&self) -> &'static str {
        "string"
    }
}

/// Unsigned 64-bit integers, var-length encoded.
#[derive(Clone, Copy, Debug, Default)]
pub struct U64Type;

impl DataType for U64Type {
    type Value = u64;

    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, _value: &u64) -> usize {
        8
    }

    fn write(&self, buf: &mut Vec<u8>, value: &u64) {
        write_var_u64(buf, *value);
    }

    fn read(&self, buf: &mut &[u8]) -> Result<u64> {
        read_var_u64(buf)
    }

    fn type_name(&self) -> &'static str {
        "u64"
    }
}

/// Raw byte strings, length-prefixed, ordered lexicographically.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesType;

impl DataType for BytesType {
    type Value = Vec<u8>;

    fn compare(&self, a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, value: &Vec<u8>) -> usize {
        24 + value.len()
    }

    fn write(&self, buf: &mut Vec<u8>, value: &Vec<u8>) {
        write_var_u64(buf, value.len() as u64);
        buf.extend_from_slice(value);
    }

    fn read(&self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let len = read_var_u64(buf)? as usize;
        Ok(read_bytes(buf, len)?.to_vec())
    }

    fn type_name(&self) -> &'static str {
        "bytes"
    }
}
