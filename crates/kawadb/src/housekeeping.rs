//! Compaction and space reclamation.
//!
//! Two mechanisms work together. *Rewrite* drains sparsely filled chunks:
//! live pages are re-put through ordinary map updates so the replacements
//! land in a fresh chunk and the old chunk's live count falls to zero,
//! after which the commit path reclaims it. *Move* defragments the file:
//! chunks are relocated byte-for-byte toward the file start and the tail
//! is truncated.
//!
//! One cycle runs at a time:
//! Idle -> CheckFragmentation -> (MoveChunks | RewriteChunks -> DropUnused)
//! -> Idle.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use log::debug;

use storage::chunk::Chunk;
use storage::free_space::RESERVE_TO_END;
use storage::{BLOCK_SIZE, Result};

use btree::map::MapCommit;

use crate::store::{Store, StoreShared, StoreState};

/// Truncation only pays off above this saving, in percent of the file.
const SHRINK_SAVINGS_PERCENT: u64 = 10;
/// Move rounds per cycle: the main sweep plus one round to relocate the
/// chunk the intervening commit wrote.
const MOVE_ROUNDS: usize = 2;

impl Store {
    /// Aggregate live fill rate over all saved chunks, in percent.
    pub fn chunks_fill_rate(&self) -> u32 {
        let chunks = self.shared.base.chunks.read();
        let (mut live, mut total) = (0u64, 0u64);
        for chunk in chunks.values().filter(|c| c.is_saved()) {
            live += chunk.live_max;
            total += chunk.max_len;
        }
        if total == 0 {
            100
        } else {
            (live * 100 / total) as u32
        }
    }

    /// File-level fill rate from the free-space bitmap, in percent.
    pub fn file_fill_rate(&self) -> u32 {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        state.free_space.fill_rate()
    }

    pub fn file_size(&self) -> Result<u64> {
        self.shared.base.file.size()
    }

    /// Rewrite chunks whose live fill rate is below `target_fill_rate`,
    /// spending at most `write_limit` bytes of live data. Returns whether
    /// anything was rewritten; reclamation follows at the next commits.
    pub fn compact(&self, target_fill_rate: u32, write_limit: usize) -> Result<bool> {
        self.shared.compact_rewrite(target_fill_rate, write_limit)
    }

    /// Full compaction cycle with a time budget: rewrite sparse chunks,
    /// reclaim them, move the remainder toward the file start and shrink
    /// the file. Retention is narrowed to the current version for the
    /// duration; pinned snapshots stay protected.
    pub fn compact_file(&self, max_compact_time_ms: u64) -> Result<()> {
        let shared = &self.shared;
        if shared.housekeeping_active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let configured = shared.base.versions_to_keep.swap(1, Ordering::Relaxed);
        let result = self.compact_file_inner(max_compact_time_ms);
        shared
            .base
            .versions_to_keep
            .store(configured, Ordering::Relaxed);
        shared.housekeeping_active.store(false, Ordering::Release);
        result
    }

    fn compact_file_inner(&self, max_compact_time_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(max_compact_time_ms);
        self.shared.commit_internal()?;
        let mut previous_size = u64::MAX;
        loop {
            // the forced commit applies deferred removals and frees dead
            // chunks under the narrowed retention bound, so the fill rates
            // below reflect reality
            self.shared.commit_force()?;
            let rewrote = self.shared.compact_rewrite(95, 16 * 1024 * 1024)?;
            self.shared.compact_move_chunks(MOVE_ROUNDS)?;
            // explicit compaction truncates any tail saving
            self.shared.shrink_file(0)?;
            let size = self.file_size()?;
            if (!rewrote && size >= previous_size) || Instant::now() >= deadline {
                break;
            }
            previous_size = size;
        }
        Ok(())
    }
}

impl StoreShared {
    /// One background housekeeping cycle; a no-op when a cycle is already
    /// running.
    pub(crate) fn auto_compact(self: &Arc<Self>) -> Result<()> {
        if self.housekeeping_active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.housekeeping_cycle();
        self.housekeeping_active.store(false, Ordering::Release);
        result
    }

    fn housekeeping_cycle(&self) -> Result<()> {
        let target = self.config.auto_compact_fill_rate;
        // CheckFragmentation
        let (file_fill, fragmented) = {
            let guard = self.state.lock();
            let state = guard.borrow();
            (state.free_space.fill_rate(), state.free_space.is_fragmented())
        };
        let chunks_fill = {
            let chunks = self.base.chunks.read();
            let (mut live, mut total) = (0u64, 0u64);
            for chunk in chunks.values().filter(|c| c.is_saved()) {
                live += chunk.live_max;
                total += chunk.max_len;
            }
            if total == 0 { 100 } else { (live * 100 / total) as u32 }
        };

        if fragmented && file_fill < target {
            debug!("housekeeping: moving chunks (fill {file_fill}%)");
            self.compact_move_chunks(MOVE_ROUNDS)?;
            self.shrink_file(SHRINK_SAVINGS_PERCENT)?;
        } else if chunks_fill < target {
            debug!("housekeeping: rewriting chunks (chunk fill {chunks_fill}%)");
            // the idle budget is twice the auto-commit memory; under write
            // back-pressure the budget shrinks to a quarter
            let budget = if self.base.unsaved_memory.load(Ordering::Relaxed) == 0 {
                self.config.auto_commit_memory() * 2
            } else {
                self.config.auto_commit_memory() / 4
            };
            if self.compact_rewrite(target, budget)? {
                // DropUnused: the commit applies removals and frees chunks
                self.commit_internal()?;
            }
        }
        Ok(())
    }

    /// Pick the most sparsely filled rewritable chunks up to `write_limit`
    /// live bytes and rewrite them through their maps.
    pub(crate) fn compact_rewrite(&self, target_fill_rate: u32, write_limit: usize) -> Result<bool> {
        self.base.check_writable()?;
        let last_chunk_id = {
            let guard = self.state.lock();
            let state = guard.borrow();
            state.last_chunk_id
        };
        let mut candidates: Vec<Chunk> = {
            let chunks = self.base.chunks.read();
            chunks
                .values()
                .filter(|c| {
                    c.id != last_chunk_id && c.is_rewritable() && c.fill_rate() < target_fill_rate
                })
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return Ok(false);
        }
        candidates.sort_by_key(|c| (c.fill_rate(), c.block));
        let mut set = HashSet::new();
        let mut budget = 0u64;
        for chunk in &candidates {
            if budget >= write_limit as u64 {
                break;
            }
            set.insert(chunk.id);
            budget += chunk.live_max;
        }

        let maps: Vec<Arc<dyn MapCommit>> = self.maps.read().values().cloned().collect();
        let mut rewritten = 0usize;
        for map in maps {
            rewritten += map.rewrite_chunks(&set)?;
        }
        rewritten += self.meta.rewrite(&set)?;
        rewritten += self.layout.rewrite(&set)?;
        debug!(
            "rewrote {rewritten} pages out of {} chunks",
            set.len()
        );
        if rewritten > 0 {
            self.commit_internal()?;
        }
        Ok(rewritten > 0)
    }

    /// Physically relocate chunks toward the file start. Each round moves
    /// every chunk that has room below it, commits, and repeats so the
    /// chunk written by that commit moves down as well.
    pub(crate) fn compact_move_chunks(&self, rounds: usize) -> Result<()> {
        self.base.check_writable()?;
        for _ in 0..rounds {
            let moved = {
                let guard = self.state.lock();
                let mut state = guard.borrow_mut();
                let first_free = state.free_space.first_free_block();
                let mut movable: Vec<(u64, Chunk)> = {
                    let chunks = self.base.chunks.read();
                    chunks
                        .values()
                        .filter(|c| c.is_saved() && c.is_evacuatable() && c.block > first_free)
                        .map(|c| {
                            (state.free_space.move_priority(c.block, c.len), c.clone())
                        })
                        .collect()
                };
                if movable.is_empty() {
                    0
                } else {
                    // highest priority first, ties toward the file start
                    movable.sort_by(|(pa, a), (pb, b)| {
                        pb.cmp(pa).then(a.block.cmp(&b.block))
                    });
                    let mut moved = 0usize;
                    for (_, chunk) in movable {
                        if self.move_chunk(&mut state, chunk)? {
                            moved += 1;
                        }
                    }
                    moved
                }
            };
            if moved == 0 {
                break;
            }
            // persist the relocated chunk metadata
            self.commit_force()?;
        }
        Ok(())
    }

    /// Copy one chunk into free space below its current block. The header
    /// and footer are rewritten with the new block, the payload moves
    /// byte-for-byte and the prediction is cleared.
    fn move_chunk(&self, state: &mut StoreState, chunk: Chunk) -> Result<bool> {
        let new_block =
            state
                .free_space
                .predict_allocation(chunk.len, chunk.block, RESERVE_TO_END);
        if new_block == u64::MAX || new_block >= chunk.block {
            return Ok(false);
        }
        state.reserved = Some((chunk.block, RESERVE_TO_END));
        let allocated = state
            .free_space
            .allocate(chunk.len, chunk.block, RESERVE_TO_END);
        state.reserved = None;
        debug_assert_eq!(allocated, new_block);

        let payload = self.base.file.read_fully(
            chunk.block * BLOCK_SIZE as u64 + BLOCK_SIZE as u64,
            (chunk.len as usize - 2) * BLOCK_SIZE,
        )?;
        let mut moved = chunk.clone();
        moved.block = new_block;
        moved.next = 0;
        let mut bytes = Vec::with_capacity(chunk.len as usize * BLOCK_SIZE);
        bytes.extend_from_slice(&moved.write_header());
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&moved.write_footer());
        self.base
            .file
            .write_fully(new_block * BLOCK_SIZE as u64, &bytes)?;
        self.base.file.sync()?;

        // release the old blocks only after the copy landed
        state.free_space.free(chunk.block, chunk.len);
        self.base.chunks.write().insert(moved.id, moved.clone());
        state.dirty_chunks.insert(moved.id);
        state.freed_chunk_since_header = true;
        if state.last_chunk_id == moved.id {
            state.header.block = new_block;
        }
        debug!(
            "moved chunk {} from block {} to {}",
            moved.id, chunk.block, new_block
        );
        Ok(true)
    }

    /// Truncate the file when at least `min_savings_percent` of it has
    /// been vacated at the tail.
    pub(crate) fn shrink_file(&self, min_savings_percent: u64) -> Result<()> {
        let guard = self.state.lock();
        let state = guard.borrow();
        let used_blocks = state.free_space.last_used_block();
        let file_blocks = self.base.file.size()? / BLOCK_SIZE as u64;
        if file_blocks <= used_blocks {
            return Ok(());
        }
        let savings = (file_blocks - used_blocks) * 100 / file_blocks;
        if savings < min_savings_percent {
            return Ok(());
        }
        debug!(
            "shrinking file from {file_blocks} to {used_blocks} blocks ({savings}% saved)"
        );
        self.base.file.truncate(used_blocks * BLOCK_SIZE as u64)?;
        self.base.file.sync()
    }
}
