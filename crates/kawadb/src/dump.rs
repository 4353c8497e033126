//! Inspection of a store file without consulting the layout map: the
//! store header locates the newest chunk, and the chunk chain is walked
//! through the whole file by probing each block for a valid header.

use std::io::Write;
use std::path::Path;

use storage::chunk::Chunk;
use storage::file_store::FileStore;
use storage::{BLOCK_SIZE, Result, StoreError};

/// Walk `path` and write one line per store header and chunk to `out`.
pub fn dump(path: &Path, out: &mut dyn Write) -> Result<()> {
    let file = FileStore::open(path, true)?;
    let io_error = |e: std::io::Error| StoreError::WritingFailed {
        context: "writing dump output".into(),
        source: e,
    };

    let (header, both_ok) = file.read_store_header()?;
    writeln!(
        out,
        "store header: format {}, created {:x}, version {:x}, newest chunk {} at block {}, \
         clean={}, copies-agree={}",
        header.format, header.created, header.version, header.chunk, header.block, header.clean,
        both_ok,
    )
    .map_err(io_error)?;

    let blocks = file.size()? / BLOCK_SIZE as u64;
    let mut block = 2u64;
    let mut chunks = 0usize;
    while block < blocks {
        match try_chunk_at(&file, block, blocks) {
            Some(chunk) => {
                writeln!(
                    out,
                    "chunk {} at block {}: len {} blocks, version {:x}, pages {} ({} live), \
                     next {}",
                    chunk.id,
                    chunk.block,
                    chunk.len,
                    chunk.version,
                    chunk.page_count,
                    chunk.live_pages,
                    chunk.next,
                )
                .map_err(io_error)?;
                chunks += 1;
                block += chunk.len;
            }
            None => block += 1,
        }
    }
    writeln!(out, "{chunks} chunks, {blocks} blocks").map_err(io_error)?;
    Ok(())
}

fn try_chunk_at(file: &FileStore, block: u64, file_blocks: u64) -> Option<Chunk> {
    let bytes = file.read_fully(block * BLOCK_SIZE as u64, BLOCK_SIZE).ok()?;
    let chunk = Chunk::read_header(&bytes).ok()?;
    if chunk.block != block || chunk.len < 2 || block + chunk.len > file_blocks {
        return None;
    }
    let footer_bytes = file
        .read_fully((block + chunk.len - 1) * BLOCK_SIZE as u64, BLOCK_SIZE)
        .ok()?;
    let footer = Chunk::read_footer(&footer_bytes).ok()?;
    chunk.matches_footer(&footer).then_some(chunk)
}
