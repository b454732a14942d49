use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rusqlite::Connection;

use crate::core::errors::IndexerError;
use crate::core::protocol::event_decoding::BlockIndexEntry;
use crate::db::records::ReorgStat;
use crate::db::{
    delete_block_hash_at_block_height, delete_block_hashes_above_block_height,
    delete_inscriptions_above_block_height, delete_inscriptions_at_block_height,
    find_block_hash_at_block_height, insert_reorg_stat,
};
use crate::utils::Context;
use crate::{try_info, try_warn};

/// Runs once per cycle over the secondary block-index log. A declared hash
/// that differs from the stored hash at the same height confirms a reorg:
/// everything above the divergence point minus one is rolled back, one
/// audit entry is written, and the effective committed height is lowered so
/// the next cycle re-derives the range from the external process's replay.
///
/// Returns the possibly-lowered committed height.
pub fn detect_and_reconcile(
    entries: &[BlockIndexEntry],
    committed_height: Option<u64>,
    first_tracked_height: u64,
    conn: &Connection,
    ctx: &Context,
) -> Result<Option<u64>, IndexerError> {
    let mut current_height = committed_height;

    for entry in entries.iter() {
        let committed = match current_height {
            Some(committed) => committed,
            None => break,
        };
        if entry.height > committed || entry.height < first_tracked_height {
            continue;
        }
        try_warn!(
            ctx,
            "Block #{} repeating in the index log, checking for a reorg",
            entry.height
        );
        let stored_hash = find_block_hash_at_block_height(entry.height, conn)
            .map_err(IndexerError::Storage)?;
        let stored_hash = match stored_hash {
            Some(hash) => hash,
            None => continue,
        };
        if stored_hash == entry.hash {
            continue;
        }

        let reorg_start = Instant::now();
        try_warn!(
            ctx,
            "Reorg detected at block #{}: stored hash {} replaced by {}",
            entry.height,
            stored_hash,
            entry.hash
        );

        let rollback_height = entry.height.saturating_sub(1);
        let mut deleted_records =
            delete_inscriptions_above_block_height(rollback_height, conn)
                .map_err(IndexerError::Storage)?;
        let mut deleted_hashes = delete_block_hashes_above_block_height(rollback_height, conn)
            .map_err(IndexerError::Storage)?;
        if entry.height == 0 {
            deleted_records += delete_inscriptions_at_block_height(0, conn)
                .map_err(IndexerError::Storage)?;
            deleted_hashes +=
                delete_block_hash_at_block_height(0, conn).map_err(IndexerError::Storage)?;
        }

        insert_reorg_stat(
            &ReorgStat {
                reorg_tm_ms: reorg_start.elapsed().as_millis() as u64,
                old_block_height: committed,
                new_block_height: rollback_height,
                created_at_ms: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|duration| duration.as_millis() as u64)
                    .unwrap_or(0),
            },
            conn,
        )
        .map_err(IndexerError::Storage)?;

        try_info!(
            ctx,
            "Reverted to block #{} ({} inscriptions, {} block hashes deleted)",
            rollback_height,
            deleted_records,
            deleted_hashes
        );

        current_height = Some(committed.min(rollback_height));
    }

    Ok(current_height)
}
