use std::collections::BTreeMap;

use bitvec::vec::BitVec;

use crate::BLOCK_SIZE;
use crate::data_util::{
    format_header_map, format_hex_u64, header_u32, header_u64, parse_header_map,
};
use crate::error::{Result, StoreError};
use crate::position::MAX_CHUNK_ID;

/// Metadata of one chunk: a contiguous run of file blocks holding the pages
/// of one commit. The first block is the chunk header, the last block the
/// footer; page payload lives in between.
///
/// Chunks are the unit of allocation and reclamation. Live-page counters
/// track how much of the payload is still referenced; a chunk whose live
/// count drops to zero is reclaimed once no retained version can reach it.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk id; wraps at [`MAX_CHUNK_ID`].
    pub id: u32,
    /// Store version at which the chunk was written.
    pub version: u64,
    /// Start block, 0 while unallocated.
    pub block: u64,
    /// Length in blocks, including header and footer blocks.
    pub len: u64,
    /// Pages written into the chunk.
    pub page_count: u32,
    /// Pages still referenced from some retained version.
    pub live_pages: u32,
    /// Total serialized bytes of all pages.
    pub max_len: u64,
    /// Serialized bytes of the live pages.
    pub live_max: u64,
    /// Pinned pages cannot be evacuated by compaction.
    pub pin_count: u32,
    /// Predicted start block of the next chunk.
    pub next: u64,
    /// Milliseconds since store creation.
    pub time: u64,
    /// Position of the layout map root written with this chunk.
    pub layout_root: u64,
    /// Highest map id allocated when the chunk was written.
    pub map_high_water: u32,
    /// Map ids with at least one page in this chunk.
    pub occupancy: BitVec,
}

/// The subset of chunk attributes carried by the footer block, enough to
/// locate and validate the chunk when scanning the file backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFooter {
    pub id: u32,
    pub block: u64,
    pub version: u64,
}

impl Chunk {
    pub fn new(id: u32, version: u64) -> Self {
        assert!(id <= MAX_CHUNK_ID);
        Chunk {
            id,
            version,
            block: 0,
            len: 0,
            page_count: 0,
            live_pages: 0,
            max_len: 0,
            live_max: 0,
            pin_count: 0,
            next: 0,
            time: 0,
            layout_root: 0,
            map_high_water: 0,
            occupancy: BitVec::new(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.block != 0
    }

    pub fn is_saved(&self) -> bool {
        self.is_allocated()
    }

    pub fn is_live(&self) -> bool {
        self.live_pages > 0
    }

    pub fn is_evacuatable(&self) -> bool {
        self.pin_count == 0
    }

    /// Rewriting pays off only for saved chunks that still carry live pages
    /// but are not fully occupied.
    pub fn is_rewritable(&self) -> bool {
        self.is_saved()
            && self.is_live()
            && self.is_evacuatable()
            && self.live_pages < self.page_count
    }

    /// Percentage of payload bytes still live.
    pub fn fill_rate(&self) -> u32 {
        if self.max_len == 0 {
            return 0;
        }
        if self.live_max >= self.max_len {
            return 100;
        }
        (self.live_max * 100 / self.max_len) as u32
    }

    pub fn mark_map(&mut self, map_id: u32) {
        let idx = map_id as usize;
        if self.occupancy.len() <= idx {
            self.occupancy.resize(idx + 1, false);
        }
        self.occupancy.set(idx, true);
    }

    pub fn has_map(&self, map_id: u32) -> bool {
        self.occupancy
            .get(map_id as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    pub fn map_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.occupancy.iter_ones().map(|i| i as u32)
    }

    fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("chunk".into(), format_hex_u64(self.id as u64));
        map.insert("block".into(), format_hex_u64(self.block));
        map.insert("len".into(), format_hex_u64(self.len));
        map.insert("pages".into(), format_hex_u64(self.page_count as u64));
        map.insert("livePages".into(), format_hex_u64(self.live_pages as u64));
        map.insert("max".into(), format_hex_u64(self.max_len));
        map.insert("liveMax".into(), format_hex_u64(self.live_max));
        map.insert("root".into(), format_hex_u64(self.layout_root));
        map.insert("time".into(), format_hex_u64(self.time));
        map.insert("version".into(), format_hex_u64(self.version));
        map.insert("next".into(), format_hex_u64(self.next));
        map.insert("map".into(), format_hex_u64(self.map_high_water as u64));
        if self.pin_count > 0 {
            map.insert("pinCount".into(), format_hex_u64(self.pin_count as u64));
        }
        if !self.occupancy.is_empty() {
            map.insert("occupancy".into(), occupancy_to_hex(&self.occupancy));
        }
        map
    }

    fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let id = header_u32(map, "chunk")?;
        if id > MAX_CHUNK_ID {
            return Err(StoreError::FileCorrupt(format!("chunk id {id} out of range")));
        }
        let mut chunk = Chunk::new(id, header_u64(map, "version")?);
        chunk.block = header_u64(map, "block")?;
        chunk.len = header_u64(map, "len")?;
        chunk.page_count = header_u32(map, "pages")?;
        chunk.live_pages = header_u32(map, "livePages")?;
        chunk.max_len = header_u64(map, "max")?;
        chunk.live_max = header_u64(map, "liveMax")?;
        chunk.layout_root = header_u64(map, "root")?;
        chunk.time = header_u64(map, "time")?;
        chunk.next = header_u64(map, "next")?;
        chunk.map_high_water = header_u32(map, "map")?;
        if let Some(pins) = map.get("pinCount") {
            chunk.pin_count = crate::data_util::parse_hex_u32(pins)?;
        }
        if let Some(occ) = map.get("occupancy") {
            chunk.occupancy = occupancy_from_hex(occ)?;
        }
        Ok(chunk)
    }

    /// Serialize the chunk header, padded to one block.
    pub fn write_header(&self) -> Vec<u8> {
        let mut bytes = format_header_map(&self.to_map());
        assert!(bytes.len() <= BLOCK_SIZE, "chunk header exceeds one block");
        bytes.resize(BLOCK_SIZE, b' ');
        bytes
    }

    /// Parse and checksum-verify a chunk header block.
    pub fn read_header(bytes: &[u8]) -> Result<Self> {
        Self::from_map(&parse_header_map(bytes)?)
    }

    /// Serialize the chunk footer, padded to one block.
    pub fn write_footer(&self) -> Vec<u8> {
        let mut map = BTreeMap::new();
        map.insert("chunk".into(), format_hex_u64(self.id as u64));
        map.insert("block".into(), format_hex_u64(self.block));
        map.insert("version".into(), format_hex_u64(self.version));
        let mut bytes = format_header_map(&map);
        bytes.resize(BLOCK_SIZE, b' ');
        bytes
    }

    /// Parse and checksum-verify a chunk footer block.
    pub fn read_footer(bytes: &[u8]) -> Result<ChunkFooter> {
        let map = parse_header_map(bytes)?;
        Ok(ChunkFooter {
            id: header_u32(&map, "chunk")?,
            block: header_u64(&map, "block")?,
            version: header_u64(&map, "version")?,
        })
    }

    /// The layout map `chunk.<id>` metadata value.
    pub fn collect_metadata(&self) -> String {
        let bytes = format_header_map(&self.to_map());
        let mut s = String::from_utf8(bytes).expect("header maps are ASCII");
        s.pop(); // trailing newline
        s
    }

    /// Parse a layout map `chunk.<id>` metadata value.
    pub fn from_metadata(value: &str) -> Result<Self> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(b'\n');
        Self::from_map(&parse_header_map(&bytes)?)
    }

    /// Consistency check between a header and a footer of the same chunk.
    pub fn matches_footer(&self, footer: &ChunkFooter) -> bool {
        self.id == footer.id && self.block == footer.block && self.version == footer.version
    }

    /// The id following `id` in chunk-id order, wrapping at the maximum.
    pub fn next_id(id: u32) -> u32 {
        if id >= MAX_CHUNK_ID { 1 } else { id + 1 }
    }
}

fn occupancy_to_hex(set: &BitVec) -> String {
    let mut bytes = vec![0u8; set.len().div_ceil(8)];
    for idx in set.iter_ones() {
        bytes[idx / 8] |= 1u8 << (idx % 8);
    }
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn occupancy_from_hex(s: &str) -> Result<BitVec> {
    if s.len() % 2 != 0 {
        return Err(StoreError::FileCorrupt("bad occupancy string".into()));
    }
    let mut set = BitVec::new();
    set.resize(s.len() / 2 * 8, false);
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hex = std::str::from_utf8(chunk).unwrap();
        let b = u8::from_str_radix(hex, 16)
            .map_err(|_| StoreError::FileCorrupt("bad occupancy string".into()))?;
        for bit in 0..8usize {
            if b & (1u8 << bit) != 0 {
                set.set(i * 8 + bit, true);
            }
        }
    }
    Ok(set)
}
