use bitvec::vec::BitVec;

/// Free-space accounting over file blocks.
///
/// Bit `i` is set when block `i` is allocated. Blocks 0 and 1 hold the two
/// store header copies and are permanently in use. A reserved interval can
/// be excluded from allocation while compaction relocates chunks.
pub struct FreeSpaceBitSet {
    set: BitVec,
}

/// First block available for chunk allocation.
pub const FIRST_FREE_BLOCK: u64 = 2;

/// `reserved_high` value meaning "everything from `reserved_low` on".
pub const RESERVE_TO_END: u64 = u64::MAX;

impl FreeSpaceBitSet {
    pub fn new() -> Self {
        let mut set = BitVec::new();
        set.resize(FIRST_FREE_BLOCK as usize, true);
        FreeSpaceBitSet { set }
    }

    /// Allocate the lowest contiguous run of `length` blocks, skipping the
    /// reserved interval, and mark it used.
    pub fn allocate(&mut self, length: u64, reserved_low: u64, reserved_high: u64) -> u64 {
        let block = self.find_run(length, reserved_low, reserved_high);
        self.mark_used(block, length);
        block
    }

    /// The block [`allocate`] would return, without committing.
    pub fn predict_allocation(&self, length: u64, reserved_low: u64, reserved_high: u64) -> u64 {
        self.find_run(length, reserved_low, reserved_high)
    }

    fn find_run(&self, length: u64, reserved_low: u64, reserved_high: u64) -> u64 {
        assert!(length > 0);
        let reserved_high = if reserved_high == RESERVE_TO_END {
            u64::MAX
        } else {
            reserved_high
        };
        let mut block = FIRST_FREE_BLOCK;
        loop {
            if block >= reserved_low && block < reserved_high {
                block = reserved_high;
                if block == u64::MAX {
                    // reserved to the end: nothing beyond is usable, and
                    // nothing below was free; the caller never reserves
                    // everything, so this is unreachable in practice
                    return block;
                }
            }
            let mut run = 0;
            while run < length {
                let b = block + run;
                if b >= reserved_low && b < reserved_high {
                    break;
                }
                if self.is_used(b) {
                    break;
                }
                run += 1;
            }
            if run == length {
                return block;
            }
            block += run + 1;
        }
    }

    pub fn mark_used(&mut self, block: u64, length: u64) {
        let end = (block + length) as usize;
        if self.set.len() < end {
            self.set.resize(end, false);
        }
        for i in block..block + length {
            self.set.set(i as usize, true);
        }
    }

    pub fn free(&mut self, block: u64, length: u64) {
        let end = std::cmp::min((block + length) as usize, self.set.len());
        for i in block as usize..end {
            self.set.set(i, false);
        }
    }

    pub fn is_used(&self, block: u64) -> bool {
        self.set
            .get(block as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// One past the highest used block; the minimum file length in blocks.
    pub fn last_used_block(&self) -> u64 {
        self.set.iter_ones().next_back().map(|i| i as u64 + 1).unwrap_or(0)
    }

    /// Start of the first free run, in blocks.
    pub fn first_free_block(&self) -> u64 {
        let mut block = FIRST_FREE_BLOCK;
        while self.is_used(block) {
            block += 1;
        }
        block
    }

    /// Percentage of used blocks within `[0, last_used_block)`.
    pub fn fill_rate(&self) -> u32 {
        let total = self.last_used_block();
        if total == 0 {
            return 100;
        }
        let used = self.set.count_ones() as u64;
        (used * 100 / total) as u32
    }

    /// Total free blocks before the end of the used area.
    pub fn free_in_use_area(&self) -> u64 {
        let total = self.last_used_block();
        total - self.set.count_ones() as u64
    }

    /// Fragmented when the free space inside the used area is spread over
    /// holes none of which dominates: the largest hole covers less than
    /// half of the total free space.
    pub fn is_fragmented(&self) -> bool {
        let total_free = self.free_in_use_area();
        if total_free == 0 {
            return false;
        }
        self.largest_hole() * 2 < total_free
    }

    fn largest_hole(&self) -> u64 {
        let end = self.last_used_block();
        let mut largest = 0u64;
        let mut run = 0u64;
        for block in FIRST_FREE_BLOCK..end {
            if self.is_used(block) {
                largest = largest.max(run);
                run = 0;
            } else {
                run += 1;
            }
        }
        largest.max(run)
    }

    /// Move priority of the chunk occupying `[block, block + length)`:
    /// larger for small chunks adjacent to large holes, so they are moved
    /// first during compaction. Ties are broken by the caller toward the
    /// lower block number.
    pub fn move_priority(&self, block: u64, length: u64) -> u64 {
        let mut hole = 0u64;
        let mut b = block;
        while b > FIRST_FREE_BLOCK && !self.is_used(b - 1) {
            hole += 1;
            b -= 1;
        }
        let end = self.last_used_block();
        let mut a = block + length;
        while a < end && !self.is_used(a) {
            hole += 1;
            a += 1;
        }
        (hole + 1) * 1024 / length.max(1)
    }
}

impl Default for FreeSpaceBitSet {
    fn default() -> Self {
        Self::new()
    }
}
