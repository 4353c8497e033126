use crate::free_space::*;

#[test]
fn test_header_blocks_are_used() {
    let fs = FreeSpaceBitSet::new();
    assert!(fs.is_used(0));
    assert!(fs.is_used(1));
    assert!(!fs.is_used(2));
    assert_eq!(fs.first_free_block(), FIRST_FREE_BLOCK);
}

#[test]
fn test_allocate_lowest_fit() {
    let mut fs = FreeSpaceBitSet::new();
    assert_eq!(fs.allocate(3, 0, 0), 2);
    assert_eq!(fs.allocate(2, 0, 0), 5);
    fs.free(2, 3);
    // the freed hole is the lowest fit again
    assert_eq!(fs.allocate(2, 0, 0), 2);
    // a run of 3 no longer fits into the remaining 1-block hole
    assert_eq!(fs.allocate(3, 0, 0), 7);
}

#[test]
fn test_predict_matches_allocate() {
    let mut fs = FreeSpaceBitSet::new();
    fs.allocate(4, 0, 0);
    fs.free(3, 1);
    let predicted = fs.predict_allocation(1, 0, 0);
    assert_eq!(fs.allocate(1, 0, 0), predicted);
}

#[test]
fn test_reserved_interval_is_skipped() {
    let mut fs = FreeSpaceBitSet::new();
    // blocks 2..10 free, but 2..6 reserved
    let block = fs.allocate(2, 2, 6);
    assert_eq!(block, 6);
    // reserving to the end forces allocation below
    fs.free(2, 4);
    let low = fs.allocate(2, 8, RESERVE_TO_END);
    assert_eq!(low, 2);
}

#[test]
fn test_fill_rate_and_last_used() {
    let mut fs = FreeSpaceBitSet::new();
    assert_eq!(fs.fill_rate(), 100);
    fs.mark_used(2, 8);
    assert_eq!(fs.last_used_block(), 10);
    assert_eq!(fs.fill_rate(), 100);
    fs.free(4, 5);
    assert_eq!(fs.last_used_block(), 10);
    assert_eq!(fs.fill_rate(), 50);
}

#[test]
fn test_fragmentation_heuristic() {
    let mut fs = FreeSpaceBitSet::new();
    fs.mark_used(2, 20);
    assert!(!fs.is_fragmented());
    // one dominant hole: not fragmented
    fs.free(4, 10);
    assert!(!fs.is_fragmented());
    // many small holes: fragmented
    let mut fs = FreeSpaceBitSet::new();
    fs.mark_used(2, 20);
    for b in [3u64, 6, 9, 12, 15, 18] {
        fs.free(b, 1);
    }
    assert!(fs.is_fragmented());
}

#[test]
fn test_move_priority_prefers_small_chunks_near_big_holes() {
    let mut fs = FreeSpaceBitSet::new();
    fs.mark_used(2, 30);
    fs.free(10, 8); // large hole before block 18
    let small_near_hole = fs.move_priority(18, 2);
    let large_far = fs.move_priority(24, 8);
    assert!(small_near_hole > large_far);
}
