use crate::BLOCK_SIZE;
use crate::chunk::Chunk;
use crate::position::MAX_CHUNK_ID;

fn sample_chunk() -> Chunk {
    let mut chunk = Chunk::new(123, 789);
    chunk.block = 456;
    chunk.len = 7;
    chunk.page_count = 10;
    chunk.live_pages = 5;
    chunk.max_len = 9999;
    chunk.live_max = 5000;
    chunk.next = 463;
    chunk.time = 1234567890;
    chunk.layout_root = 0x1234_5678;
    chunk.map_high_water = 42;
    chunk.mark_map(0);
    chunk.mark_map(2);
    chunk.mark_map(42);
    chunk
}

#[test]
fn test_header_roundtrip() {
    let original = sample_chunk();
    let serialized = original.write_header();
    assert_eq!(serialized.len(), BLOCK_SIZE);
    let parsed = Chunk::read_header(&serialized).unwrap();
    assert_eq!(parsed.id, original.id);
    assert_eq!(parsed.version, original.version);
    assert_eq!(parsed.block, original.block);
    assert_eq!(parsed.len, original.len);
    assert_eq!(parsed.page_count, original.page_count);
    assert_eq!(parsed.live_pages, original.live_pages);
    assert_eq!(parsed.max_len, original.max_len);
    assert_eq!(parsed.live_max, original.live_max);
    assert_eq!(parsed.next, original.next);
    assert_eq!(parsed.time, original.time);
    assert_eq!(parsed.layout_root, original.layout_root);
    assert_eq!(parsed.map_high_water, original.map_high_water);
    let maps: Vec<u32> = parsed.map_ids().collect();
    assert_eq!(maps, vec![0, 2, 42]);
}

#[test]
fn test_footer_roundtrip_and_match() {
    let original = sample_chunk();
    let serialized = original.write_footer();
    assert_eq!(serialized.len(), BLOCK_SIZE);
    let footer = Chunk::read_footer(&serialized).unwrap();
    assert_eq!(footer.id, original.id);
    assert_eq!(footer.block, original.block);
    assert_eq!(footer.version, original.version);
    assert!(original.matches_footer(&footer));

    let other = Chunk::new(7, 1);
    assert!(!other.matches_footer(&footer));
}

#[test]
fn test_corrupt_header_is_rejected() {
    let mut serialized = sample_chunk().write_header();
    serialized[10] ^= 0xff;
    assert!(Chunk::read_header(&serialized).is_err());
}

#[test]
fn test_layout_metadata_roundtrip() {
    let original = sample_chunk();
    let value = original.collect_metadata();
    assert!(!value.contains('\n'));
    let parsed = Chunk::from_metadata(&value).unwrap();
    assert_eq!(parsed.block, original.block);
    assert_eq!(parsed.live_pages, original.live_pages);
    assert!(parsed.has_map(2));
    assert!(!parsed.has_map(1));
}

#[test]
fn test_fill_rate() {
    let mut chunk = sample_chunk();
    assert_eq!(chunk.fill_rate(), 50);
    chunk.live_max = chunk.max_len;
    assert_eq!(chunk.fill_rate(), 100);
    chunk.live_max = 0;
    assert_eq!(chunk.fill_rate(), 0);
}

#[test]
fn test_rewritable_predicates() {
    let mut chunk = sample_chunk();
    assert!(chunk.is_rewritable());
    chunk.pin_count = 1;
    assert!(!chunk.is_rewritable());
    chunk.pin_count = 0;
    chunk.live_pages = chunk.page_count;
    assert!(!chunk.is_rewritable(), "fully occupied chunks are not rewritten");
    chunk.live_pages = 0;
    assert!(!chunk.is_rewritable());
    chunk.block = 0;
    assert!(!chunk.is_saved());
}

#[test]
fn test_id_wraparound() {
    assert_eq!(Chunk::next_id(1), 2);
    assert_eq!(Chunk::next_id(MAX_CHUNK_ID), 1);
}
