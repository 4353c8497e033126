//! 64-bit page positions.
//!
//! A position packs the page address into one word, high bits first:
//!
//! ```text
//! [chunk id : 26][offset : 24][max-length class : 5][type : 2][page no : 7]
//! ```
//!
//! The offset is relative to the start of the chunk. The max-length class
//! gives an upper bound on the serialized page length, so a reader knows
//! how many bytes to fetch before the exact length is known; the largest
//! class means "actual length stored inline at the page start". The page
//! number is the sequential number within the chunk, truncated to 7 bits;
//! it is informational, the offset alone addresses the page.

/// The page exists only in memory and has not been written yet.
pub const POS_UNSAVED: u64 = 0;

/// The page was removed before it could be written.
pub const POS_REMOVED: u64 = 1;

/// Chunk ids wrap at this maximum (26 bits).
pub const MAX_CHUNK_ID: u32 = (1 << 26) - 1;

/// Maximum byte offset of a page within its chunk (24 bits).
pub const MAX_PAGE_OFFSET: u32 = (1 << 24) - 1;

/// Length class meaning "read the inline length field".
pub const CLASS_INLINE: u8 = 31;

pub const TYPE_LEAF: u8 = 0;
pub const TYPE_NODE: u8 = 1;

/// Encode a page position. `length` is the serialized page length in bytes.
pub fn encode(chunk_id: u32, offset: u32, length: u32, page_type: u8, page_no: u32) -> u64 {
    debug_assert!(chunk_id <= MAX_CHUNK_ID);
    debug_assert!(offset <= MAX_PAGE_OFFSET);
    debug_assert!(page_type <= 3);
    let class = length_class(length);
    ((chunk_id as u64) << 38)
        | ((offset as u64) << 14)
        | ((class as u64) << 9)
        | ((page_type as u64) << 7)
        | ((page_no as u64) & 0x7f)
}

pub fn chunk_id(pos: u64) -> u32 {
    (pos >> 38) as u32
}

pub fn offset(pos: u64) -> u32 {
    ((pos >> 14) & 0xff_ffff) as u32
}

pub fn length_class_of(pos: u64) -> u8 {
    ((pos >> 9) & 0x1f) as u8
}

pub fn page_type(pos: u64) -> u8 {
    ((pos >> 7) & 0x3) as u8
}

pub fn page_no(pos: u64) -> u32 {
    (pos & 0x7f) as u32
}

pub fn is_leaf(pos: u64) -> bool {
    page_type(pos) == TYPE_LEAF
}

pub fn is_saved(pos: u64) -> bool {
    pos > POS_REMOVED
}

/// The smallest class whose maximum length covers `length`.
///
/// Classes 0..=30 cover 32, 48, 64, 96, 128, ... bytes, doubling every
/// second class. Anything larger falls into [`CLASS_INLINE`].
pub fn length_class(length: u32) -> u8 {
    for class in 0..CLASS_INLINE {
        if length <= max_length(class) {
            return class;
        }
    }
    CLASS_INLINE
}

/// Maximum serialized length of the given class. For [`CLASS_INLINE`] this
/// returns the read granularity; the true length is stored in the page.
pub fn max_length(class: u8) -> u32 {
    if class >= CLASS_INLINE {
        return u32::MAX;
    }
    let base = if class % 2 == 0 { 32u32 } else { 48u32 };
    base << (class / 2)
}

/// Length charged against chunk occupancy counters for the page at `pos`.
/// Classed positions are charged their class maximum so that the charge
/// can be reproduced from the position alone when the page is retired;
/// inline-length pages get a fixed nominal charge.
pub fn accounted_length(pos: u64) -> u64 {
    let class = length_class_of(pos);
    if class >= CLASS_INLINE {
        1 << 21
    } else {
        max_length(class) as u64
    }
}

/// Bytes a reader should fetch for a position before the page length is
/// known, capped by the remaining chunk bytes the caller applies.
pub fn read_length(pos: u64) -> u32 {
    let class = length_class_of(pos);
    if class == CLASS_INLINE {
        // one block is enough to see the inline length field
        4096
    } else {
        max_length(class)
    }
}
