//! The in-place update planner.
//!
//! Given the size budget `tree_size` for the rewritten header + YAML
//! region, the planner walks the surviving internal blocks in their
//! existing on-disk order and decides, greedily, which ones can keep their
//! extents untouched.  An unchanged block whose region starts at or after
//! the cursor stays exactly where it is.  Everything else (changed
//! payloads, codec changes, blocks displaced by earlier placements, and
//! brand-new blocks) is packed at the cursor and staged for a
//! random-access rewrite.  Displaced blocks are materialized here, before
//! any byte is written, so their old extents are safe to overwrite.
//!
//! The plan is abandoned (`None`) when not a single block keeps its
//! extent: a full serial rewrite costs the same and is simpler, so the
//! caller falls back to it.
//!
//! On success the returned length is the end of the last placement; the
//! caller truncates the file to it.  Two properties hold by construction:
//! placements never overlap (the cursor is monotone), and every placed
//! offset is at or past `tree_size`.

use crate::block::manager::BlockManager;
use crate::block::checksum;
use crate::compression;
use crate::constants::BLOCK_OVERHEAD;
use crate::error::Result;
use crate::generic_io::{calculate_padding, Pad};

/// Plan new offsets for every internal block.
///
/// Returns the final file length, or `None` when in-place reuse gains
/// nothing and the caller should rewrite serially.
pub fn calculate_updated_layout(
    blocks: &mut BlockManager,
    tree_size: u64,
    pad: Pad,
    block_size: usize,
) -> Result<Option<u64>> {
    let internal = blocks.internal_indices();
    if internal.is_empty() {
        return Ok(None);
    }

    let mut existing: Vec<usize> = internal
        .iter()
        .copied()
        .filter(|&i| blocks.block(i).unwrap().offset().is_some())
        .collect();
    existing.sort_by_key(|&i| blocks.block(i).unwrap().offset().unwrap());
    let fresh: Vec<usize> = internal
        .iter()
        .copied()
        .filter(|&i| blocks.block(i).unwrap().offset().is_none())
        .collect();

    let mut cursor = tree_size;
    let mut kept = 0usize;

    for &index in &existing {
        let block = blocks.block(index).unwrap();
        let (start, end) = block.extent().unwrap();
        if !payload_changed(blocks, index)? && cursor <= start {
            cursor = end;
            kept += 1;
            log::debug!("block {index} kept at offset {start}");
            continue;
        }
        place(blocks, index, &mut cursor, pad, block_size)?;
    }

    if kept == 0 {
        log::debug!("no block extent survives, giving up on in-place update");
        return Ok(None);
    }

    for &index in &fresh {
        place(blocks, index, &mut cursor, pad, block_size)?;
    }

    Ok(Some(cursor))
}

/// Has the payload (or its codec) changed since it was read from disk?
///
/// Lazily loaded payloads are unchanged by definition.  Materialized ones
/// are re-digested so an in-memory mutation is caught even though no call
/// announced it.
fn payload_changed(blocks: &BlockManager, index: usize) -> Result<bool> {
    let block = blocks.block(index).unwrap();
    if block.compression() != block.input_compression() {
        return Ok(true);
    }
    let handle = block.handle();
    let materialized = handle.borrow().is_materialized();
    if !materialized {
        return Ok(false);
    }
    let digest = checksum(handle.borrow_mut().bytes()?);
    Ok(digest != block.checksum())
}

/// Pack one block at the cursor and stage it for the rewrite pass.
fn place(
    blocks: &mut BlockManager,
    index: usize,
    cursor: &mut u64,
    pad: Pad,
    block_size: usize,
) -> Result<()> {
    let handle = blocks.block(index).unwrap().handle();
    let target = blocks.block(index).unwrap().compression();

    // Read the payload out of its old extent now; the rewrite pass may
    // overwrite that extent.
    let data = handle.borrow_mut().bytes()?.to_vec();
    let digest = checksum(&data);
    let payload = compression::compress(&data, target)?;
    let padding = calculate_padding(payload.len() as u64, pad, block_size);
    let allocated = payload.len() as u64 + padding;

    log::debug!(
        "block {index} placed at offset {cursor} ({} payload byte(s))",
        payload.len()
    );
    blocks.block_mut(index).unwrap().stage(
        *cursor,
        payload,
        data.len() as u64,
        digest,
        allocated,
    );
    *cursor += BLOCK_OVERHEAD + allocated;
    Ok(())
}
