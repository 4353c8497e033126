use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;

use storage::BLOCK_SIZE;
use storage::data_util::{check_value, read_u64_be, read_var_u32, write_var_u32, write_var_u64};
use storage::position::{self, MAX_PAGE_OFFSET, TYPE_LEAF, TYPE_NODE};
use storage::{Result, StoreError};

use crate::page::{Page, PageKind, PageRef, PosAssignment};
use crate::types::DataType;

/// Type byte: bit 0 distinguishes node from leaf, bit 1 flags a
/// compressed payload. Compressed pages are never produced here; the bit
/// is reserved for an external codec.
const TYPE_BIT_NODE: u8 = 0x01;
const TYPE_BIT_COMPRESSED: u8 = 0x02;

/// Seam between the map engine and the store: page bytes by position, the
/// page cache, and the bookkeeping the store maintains across commits.
pub trait PageSource: Send + Sync {
    /// The exact serialized bytes of the page at `pos`.
    fn read_page_bytes(&self, pos: u64) -> Result<Bytes>;

    fn cache_get(&self, pos: u64) -> Option<Arc<dyn Any + Send + Sync>>;

    fn cache_put(&self, pos: u64, page: Arc<dyn Any + Send + Sync>, memory: usize);

    /// Retire a saved page; the live counters of its chunk drop at the
    /// next commit once no retained version can read it.
    fn register_removed_page(&self, pos: u64);

    /// Unsaved page memory, for auto-commit back-pressure.
    fn register_unsaved_memory(&self, memory: usize);

    /// Version new root references are stamped with.
    fn next_write_version(&self) -> u64;

    fn oldest_version_to_keep(&self) -> u64;

    /// Keep `version` readable until the returned guard is dropped.
    fn pin_version(&self, version: u64) -> Arc<dyn Any + Send + Sync>;

    /// Persisted root position of a map at a version, for snapshots that
    /// fell out of the in-memory retention chain.
    fn root_pos_at_version(&self, map_id: u32, version: u64) -> Result<u64>;

    fn keys_per_page(&self) -> usize;

    fn page_split_size(&self) -> usize;
}

/// Serialization state of one chunk being written. The payload buffer
/// starts after the chunk header block; page offsets are relative to the
/// chunk start.
pub struct WriteContext {
    pub chunk_id: u32,
    pub buf: Vec<u8>,
    pub page_count: u32,
    /// Total serialized page bytes.
    pub total_len: u64,
    /// Total accounted page bytes, in the same units the chunk occupancy
    /// counters use when pages are retired.
    pub accounted_len: u64,
    /// Positions assigned to pages that were marked removed while being
    /// written; dead on arrival.
    pub removed_while_writing: Vec<u64>,
    /// Map ids that contributed pages.
    pub map_ids: Vec<u32>,
}

impl WriteContext {
    pub fn new(chunk_id: u32) -> Self {
        WriteContext {
            chunk_id,
            buf: Vec::new(),
            page_count: 0,
            total_len: 0,
            accounted_len: 0,
            removed_while_writing: Vec::new(),
            map_ids: Vec::new(),
        }
    }

    fn mark_map(&mut self, map_id: u32) {
        if !self.map_ids.contains(&map_id) {
            self.map_ids.push(map_id);
        }
    }
}

/// Serialize `page` and all its unsaved descendants into the chunk buffer,
/// assigning positions bottom-up. Returns the position of `page`.
pub fn write_page<K: DataType, V: DataType>(
    page: &Arc<Page<K, V>>,
    key_type: &K,
    value_type: &V,
    ctx: &mut WriteContext,
) -> Result<u64> {
    let current = page.pos();
    if position::is_saved(current) {
        return Ok(current);
    }

    // children first, so their positions are known
    let child_positions = match &page.kind {
        PageKind::Leaf { .. } => Vec::new(),
        PageKind::Node { children, .. } => {
            let mut positions = Vec::with_capacity(children.len());
            for child_ref in children {
                let pos = match &child_ref.child {
                    Some(child) => write_page(child, key_type, value_type, ctx)?,
                    None => child_ref.position(),
                };
                if !position::is_saved(pos) {
                    return Err(StoreError::Internal(
                        "child page has no position after write".into(),
                    ));
                }
                positions.push(pos);
            }
            positions
        }
    };

    let offset = BLOCK_SIZE + ctx.buf.len();
    if offset > MAX_PAGE_OFFSET as usize {
        return Err(StoreError::Internal(format!(
            "chunk payload exceeds addressable size at offset {offset}"
        )));
    }
    let page_no = ctx.page_count;
    page.set_page_no(page_no);

    let start = ctx.buf.len();
    let buf = &mut ctx.buf;
    buf.extend_from_slice(&[0u8; 6]); // length and check, patched below
    write_var_u32(buf, page_no);
    write_var_u32(buf, page.map_id());
    write_var_u32(buf, page.keys.len() as u32);
    let type_byte = if page.is_leaf() { 0 } else { TYPE_BIT_NODE };
    buf.push(type_byte);
    match &page.kind {
        PageKind::Leaf { values } => {
            for key in &page.keys {
                key_type.write(buf, key);
            }
            for value in values {
                value_type.write(buf, value);
            }
        }
        PageKind::Node { children, .. } => {
            for pos in &child_positions {
                buf.extend_from_slice(&pos.to_be_bytes());
            }
            for child_ref in children {
                write_var_u64(buf, child_ref.count);
            }
            for key in &page.keys {
                key_type.write(buf, key);
            }
        }
    }

    let len = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    let check = check_value(ctx.chunk_id)
        ^ check_value(offset as u32)
        ^ check_value(len);
    buf[start + 4..start + 6].copy_from_slice(&check.to_be_bytes());

    let page_type = if page.is_leaf() { TYPE_LEAF } else { TYPE_NODE };
    let pos = position::encode(ctx.chunk_id, offset as u32, len, page_type, page_no);

    ctx.page_count += 1;
    ctx.total_len += len as u64;
    ctx.accounted_len += position::accounted_length(pos);
    ctx.mark_map(page.map_id());

    match page.try_assign_pos(pos) {
        PosAssignment::Assigned => {}
        PosAssignment::RemovedWhileWriting => ctx.removed_while_writing.push(pos),
        PosAssignment::AlreadySaved(saved) => return Ok(saved),
    }
    Ok(pos)
}

/// Read and decode the page at `pos`, going through the cache.
pub fn read_page<K: DataType, V: DataType>(
    source: &dyn PageSource,
    pos: u64,
    map_id: u32,
    key_type: &K,
    value_type: &V,
) -> Result<Arc<Page<K, V>>> {
    if let Some(cached) = source.cache_get(pos) {
        if let Ok(page) = cached.downcast::<Page<K, V>>() {
            return Ok(page);
        }
    }
    let bytes = source.read_page_bytes(pos)?;
    let page = Arc::new(parse_page(&bytes, pos, map_id, key_type, value_type)?);
    source.cache_put(pos, page.clone(), page.memory());
    Ok(page)
}

fn parse_page<K: DataType, V: DataType>(
    bytes: &Bytes,
    pos: u64,
    map_id: u32,
    key_type: &K,
    value_type: &V,
) -> Result<Page<K, V>> {
    let corrupt = |what: &str| {
        StoreError::FileCorrupt(format!(
            "page at chunk {} offset {}: {what}",
            position::chunk_id(pos),
            position::offset(pos),
        ))
    };

    if bytes.len() < 7 {
        return Err(corrupt("truncated"));
    }
    let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    if len as usize != bytes.len() {
        return Err(corrupt("length field does not match"));
    }
    let stored_check = u16::from_be_bytes(bytes[4..6].try_into().unwrap());
    let expected_check = check_value(position::chunk_id(pos))
        ^ check_value(position::offset(pos))
        ^ check_value(len);
    if stored_check != expected_check {
        return Err(corrupt("check value mismatch"));
    }

    let mut slice = &bytes[6..];
    let page_no = read_var_u32(&mut slice)?;
    let stored_map_id = read_var_u32(&mut slice)?;
    if stored_map_id != map_id {
        return Err(corrupt(&format!(
            "wrong map id {stored_map_id}, expected {map_id}"
        )));
    }
    let key_count = read_var_u32(&mut slice)? as usize;
    let (&type_byte, rest) = slice
        .split_first()
        .ok_or_else(|| corrupt("truncated type byte"))?;
    slice = rest;
    if type_byte & TYPE_BIT_COMPRESSED != 0 {
        return Err(corrupt("compressed page without a configured codec"));
    }
    let is_node = type_byte & TYPE_BIT_NODE != 0;
    if is_node == position::is_leaf(pos) {
        return Err(corrupt("page type does not match its position"));
    }

    let page = if is_node {
        let mut positions = Vec::with_capacity(key_count + 1);
        for _ in 0..key_count + 1 {
            positions.push(read_u64_be(&mut slice)?);
        }
        let mut counts = Vec::with_capacity(key_count + 1);
        for _ in 0..key_count + 1 {
            counts.push(storage::data_util::read_var_u64(&mut slice)?);
        }
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            keys.push(key_type.read(&mut slice)?);
        }
        let children = positions
            .into_iter()
            .zip(counts)
            .map(|(child_pos, count)| PageRef::saved(child_pos, count))
            .collect();
        Page::node(map_id, keys, children, key_type)
    } else {
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            keys.push(key_type.read(&mut slice)?);
        }
        let mut values = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            values.push(value_type.read(&mut slice)?);
        }
        Page::leaf(map_id, keys, values, key_type, value_type)
    };
    page.set_pos_on_read(pos);
    page.set_page_no(page_no);
    Ok(page)
}
