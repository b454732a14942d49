pub mod records;

use std::collections::HashSet;
use std::path::PathBuf;

use rusqlite::{Connection, OpenFlags};

use crate::config::{Network, DB_VERSION, EXPECTED_ORD_VERSION, INDEXER_VERSION};
use crate::core::errors::IndexerError;
use crate::db::records::{compact_record, InscriptionRecord, ReorgStat, TransferUpdate};
use crate::try_debug;
use crate::utils::Context;

pub fn get_default_ordlog_db_file_path(base_dir: &PathBuf) -> PathBuf {
    let mut destination_path = base_dir.clone();
    destination_path.push("ordlog.sqlite");
    destination_path
}

pub fn initialize_ordlog_db(path: &PathBuf, ctx: &Context) -> Connection {
    let conn = create_or_open_readwrite_db(path, ctx);
    initialize_tables(&conn, ctx);
    conn
}

pub fn initialize_tables(conn: &Connection, ctx: &Context) {
    if let Err(e) = conn.execute(
        "CREATE TABLE IF NOT EXISTS inscriptions (
            inscription_number INTEGER NOT NULL UNIQUE,
            inscription_id TEXT NOT NULL PRIMARY KEY,
            genesis_height INTEGER NOT NULL,
            sat INTEGER NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            charms TEXT NOT NULL,
            tags TEXT NOT NULL,
            token INTEGER NOT NULL DEFAULT 0,
            location TEXT,
            output TEXT,
            output_value INTEGER,
            address TEXT,
            content_type TEXT,
            content TEXT,
            sha TEXT,
            delegate TEXT,
            metadata TEXT,
            metaprotocol TEXT,
            parent TEXT
        )",
        [],
    ) {
        ctx.try_log(|logger| {
            warn!(
                logger,
                "Unable to create table inscriptions: {}",
                e.to_string()
            )
        });
    } else {
        for statement in [
            "CREATE INDEX IF NOT EXISTS index_inscriptions_on_genesis_height ON inscriptions(genesis_height);",
            "CREATE INDEX IF NOT EXISTS index_inscriptions_on_output ON inscriptions(output);",
        ] {
            if let Err(e) = conn.execute(statement, []) {
                ctx.try_log(|logger| {
                    warn!(logger, "unable to query ordlog.sqlite: {}", e.to_string())
                });
            }
        }
    }
    for statement in [
        "CREATE TABLE IF NOT EXISTS block_hashes (
            block_height INTEGER NOT NULL PRIMARY KEY,
            block_hash TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS reorg_stats (
            reorg_tm_ms INTEGER NOT NULL,
            old_block_height INTEGER NOT NULL,
            new_block_height INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS indexer_metadata (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            db_version INTEGER NOT NULL,
            indexer_version INTEGER NOT NULL,
            ord_version TEXT NOT NULL,
            network TEXT NOT NULL
        )",
    ] {
        if let Err(e) = conn.execute(statement, []) {
            ctx.try_log(|logger| {
                warn!(logger, "unable to query ordlog.sqlite: {}", e.to_string())
            });
        }
    }
}

pub fn create_or_open_readwrite_db(cache_path: &PathBuf, ctx: &Context) -> Connection {
    let path = get_default_ordlog_db_file_path(cache_path);
    let open_flags = match std::fs::metadata(&path) {
        Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
                // need to create
                if let Some(dirp) = PathBuf::from(&path).parent() {
                    std::fs::create_dir_all(dirp).unwrap_or_else(|e| {
                        ctx.try_log(|logger| error!(logger, "{}", e.to_string()));
                    });
                }
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            } else {
                panic!("FATAL: could not stat {}", path.display());
            }
        }
        Ok(_md) => OpenFlags::SQLITE_OPEN_READ_WRITE,
    };

    let conn = loop {
        match Connection::open_with_flags(&path, open_flags) {
            Ok(conn) => break conn,
            Err(e) => {
                ctx.try_log(|logger| error!(logger, "{}", e.to_string()));
            }
        };
        std::thread::sleep(std::time::Duration::from_secs(1));
    };
    conn
}

pub fn insert_indexer_metadata(network: &Network, conn: &Connection) -> Result<(), String> {
    conn.execute(
        "INSERT OR REPLACE INTO indexer_metadata (id, db_version, indexer_version, ord_version, network)
         VALUES (0, ?1, ?2, ?3, ?4)",
        rusqlite::params![DB_VERSION, INDEXER_VERSION, EXPECTED_ORD_VERSION, network.to_string()],
    )
    .map_err(|e| format!("unable to write version marker: {e}"))?;
    Ok(())
}

/// Startup gate: the cycle must not run when the stored schema/network
/// marker disagrees with the running configuration.
pub fn check_indexer_metadata(network: &Network, conn: &Connection) -> Result<(), IndexerError> {
    let row = conn
        .query_row(
            "SELECT db_version, network FROM indexer_metadata WHERE id = 0",
            [],
            |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => IndexerError::VersionMismatch(
                "version marker not found, database must be initialized from scratch".to_string(),
            ),
            e => IndexerError::Storage(e.to_string()),
        })?;
    let (db_version, stored_network) = row;
    if db_version != DB_VERSION {
        return Err(IndexerError::VersionMismatch(format!(
            "db_version mismatch (stored {db_version}, expected {DB_VERSION}), database must be recreated from scratch"
        )));
    }
    if stored_network != network.to_string() {
        return Err(IndexerError::VersionMismatch(format!(
            "network mismatch (stored {stored_network}, running {network})"
        )));
    }
    Ok(())
}

pub fn find_max_committed_block_height(conn: &Connection) -> Result<Option<u64>, String> {
    conn.query_row("SELECT MAX(block_height) FROM block_hashes", [], |row| {
        row.get::<_, Option<u64>>(0)
    })
    .map_err(|e| format!("unable to query block_hashes: {e}"))
}

pub fn find_block_hash_at_block_height(
    block_height: u64,
    conn: &Connection,
) -> Result<Option<String>, String> {
    match conn.query_row(
        "SELECT block_hash FROM block_hashes WHERE block_height = ?1",
        rusqlite::params![block_height],
        |row| row.get::<_, String>(0),
    ) {
        Ok(hash) => Ok(Some(hash)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(format!("unable to query block_hashes: {e}")),
    }
}

/// Insert-only: an already recorded height keeps its original hash. Reorg
/// reconciliation is the only path allowed to replace a stored hash.
pub fn insert_block_hash_if_absent(
    block_height: u64,
    block_hash: &str,
    conn: &Connection,
) -> Result<(), String> {
    conn.execute(
        "INSERT OR IGNORE INTO block_hashes (block_height, block_hash) VALUES (?1, ?2)",
        rusqlite::params![block_height, block_hash],
    )
    .map_err(|e| format!("unable to write block_hashes: {e}"))?;
    Ok(())
}

pub fn delete_block_hashes_above_block_height(
    block_height: u64,
    conn: &Connection,
) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM block_hashes WHERE block_height > ?1",
        rusqlite::params![block_height],
    )
    .map_err(|e| format!("unable to delete from block_hashes: {e}"))
}

pub fn delete_block_hash_at_block_height(
    block_height: u64,
    conn: &Connection,
) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM block_hashes WHERE block_height = ?1",
        rusqlite::params![block_height],
    )
    .map_err(|e| format!("unable to delete from block_hashes: {e}"))
}

pub fn find_inscription_id_with_number(
    inscription_number: i64,
    conn: &Connection,
) -> Result<Option<String>, String> {
    match conn.query_row(
        "SELECT inscription_id FROM inscriptions WHERE inscription_number = ?1",
        rusqlite::params![inscription_number],
        |row| row.get::<_, String>(0),
    ) {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(format!("unable to query inscriptions: {e}")),
    }
}

pub fn find_existing_inscription_ids(
    inscription_ids: &[String],
    conn: &Connection,
) -> Result<HashSet<String>, String> {
    let mut existing = HashSet::new();
    // Chunked so the placeholder list stays within sqlite's bound limit.
    for chunk in inscription_ids.chunks(512) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let query = format!(
            "SELECT inscription_id FROM inscriptions WHERE inscription_id IN ({placeholders})"
        );
        let mut statement = conn
            .prepare(&query)
            .map_err(|e| format!("unable to query inscriptions: {e}"))?;
        let rows = statement
            .query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| format!("unable to query inscriptions: {e}"))?;
        for row in rows {
            existing.insert(row.map_err(|e| format!("unable to query inscriptions: {e}"))?);
        }
    }
    Ok(existing)
}

pub fn count_inscriptions_at_block_height(
    block_height: u64,
    conn: &Connection,
) -> Result<u64, String> {
    conn.query_row(
        "SELECT COUNT(*) FROM inscriptions WHERE genesis_height = ?1",
        rusqlite::params![block_height],
        |row| row.get::<_, u64>(0),
    )
    .map_err(|e| format!("unable to query inscriptions: {e}"))
}

pub fn delete_inscriptions_above_block_height(
    block_height: u64,
    conn: &Connection,
) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM inscriptions WHERE genesis_height > ?1",
        rusqlite::params![block_height],
    )
    .map_err(|e| format!("unable to delete from inscriptions: {e}"))
}

pub fn delete_inscriptions_at_block_height(
    block_height: u64,
    conn: &Connection,
) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM inscriptions WHERE genesis_height = ?1",
        rusqlite::params![block_height],
    )
    .map_err(|e| format!("unable to delete from inscriptions: {e}"))
}

/// Numbering faults surfaced by the bulk writer before anything is
/// committed.
#[derive(Debug, Clone, PartialEq)]
pub enum NumberingFault {
    GapAtStart { number: i64, height: u64 },
    GapMidBatch {
        expected: i64,
        found: i64,
        prev_height: u64,
        height: u64,
    },
}

/// Strict-increasing-number invariant over a batch ordered by ascending
/// number: the record preceding the batch must already be stored, and every
/// consecutive pair must differ by exactly one.
pub fn check_numbering_invariant(
    records: &[InscriptionRecord],
    conn: &Connection,
) -> Result<(), NumberingFault> {
    let first = match records.first() {
        Some(first) => first,
        None => return Ok(()),
    };
    if first.inscription_number > 0 {
        let previous =
            find_inscription_id_with_number(first.inscription_number - 1, conn).unwrap_or(None);
        match previous {
            Some(id) if !id.is_empty() => {}
            _ => {
                return Err(NumberingFault::GapAtStart {
                    number: first.inscription_number,
                    height: first.genesis_height,
                })
            }
        }
    }
    for pair in records.windows(2) {
        let expected = pair[0].inscription_number + 1;
        if pair[1].inscription_number != expected {
            return Err(NumberingFault::GapMidBatch {
                expected,
                found: pair[1].inscription_number,
                prev_height: pair[0].genesis_height,
                height: pair[1].genesis_height,
            });
        }
    }
    Ok(())
}

/// Batched idempotent upsert keyed by inscription id: applying the same
/// batch twice leaves the store unchanged.
pub fn insert_records_batch(
    records: &[InscriptionRecord],
    conn: &mut Connection,
) -> Result<(), String> {
    let transaction = conn
        .transaction()
        .map_err(|e| format!("unable to open transaction: {e}"))?;
    for record in records.iter() {
        let charms = serde_json::to_string(&record.charms)
            .map_err(|e| format!("unable to serialize charms: {e}"))?;
        let tags = serde_json::to_string(&record.tags)
            .map_err(|e| format!("unable to serialize tags: {e}"))?;
        let metadata = match &record.metadata {
            Some(metadata) => Some(
                serde_json::to_string(metadata)
                    .map_err(|e| format!("unable to serialize metadata: {e}"))?,
            ),
            None => None,
        };
        transaction
            .execute(
                "INSERT INTO inscriptions (
                    inscription_number, inscription_id, genesis_height, sat, timestamp_ms,
                    charms, tags, token, location, output, output_value, address,
                    content_type, content, sha, delegate, metadata, metaprotocol, parent
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                 ON CONFLICT(inscription_id) DO UPDATE SET
                    inscription_number = excluded.inscription_number,
                    genesis_height = excluded.genesis_height,
                    sat = excluded.sat,
                    timestamp_ms = excluded.timestamp_ms,
                    charms = excluded.charms,
                    tags = excluded.tags,
                    token = excluded.token,
                    location = excluded.location,
                    output = excluded.output,
                    output_value = excluded.output_value,
                    address = excluded.address,
                    content_type = excluded.content_type,
                    content = excluded.content,
                    sha = excluded.sha,
                    delegate = excluded.delegate,
                    metadata = excluded.metadata,
                    metaprotocol = excluded.metaprotocol,
                    parent = excluded.parent",
                rusqlite::params![
                    record.inscription_number,
                    record.inscription_id,
                    record.genesis_height,
                    record.sat,
                    record.timestamp_ms,
                    charms,
                    tags,
                    record.token,
                    record.location,
                    record.output,
                    record.output_value,
                    record.address,
                    record.content_type,
                    record.content,
                    record.sha,
                    record.delegate,
                    metadata,
                    record.metaprotocol,
                    record.parent,
                ],
            )
            .map_err(|e| {
                format!(
                    "unable to upsert inscription {}: {e}",
                    record.inscription_id
                )
            })?;
    }
    transaction
        .commit()
        .map_err(|e| format!("unable to commit batch: {e}"))?;
    Ok(())
}

/// Moves records to their new satpoint. Keyed by the current output; an
/// update whose old output matches nothing is a no-op, not an error.
pub fn apply_transfer_updates(
    updates: &[TransferUpdate],
    conn: &mut Connection,
) -> Result<usize, String> {
    let transaction = conn
        .transaction()
        .map_err(|e| format!("unable to open transaction: {e}"))?;
    let mut applied = 0;
    for update in updates.iter() {
        applied += transaction
            .execute(
                "UPDATE inscriptions SET
                    location = ?1,
                    output = ?2,
                    output_value = ?3,
                    address = ?4,
                    timestamp_ms = ?5
                 WHERE output = ?6",
                rusqlite::params![
                    update.new_location,
                    update.new_output,
                    update.new_output_value,
                    update.new_address,
                    update.timestamp_ms,
                    update.old_output,
                ],
            )
            .map_err(|e| format!("unable to apply transfer update: {e}"))?;
    }
    transaction
        .commit()
        .map_err(|e| format!("unable to commit transfer updates: {e}"))?;
    Ok(applied)
}

pub fn insert_reorg_stat(stat: &ReorgStat, conn: &Connection) -> Result<(), String> {
    conn.execute(
        "INSERT INTO reorg_stats (reorg_tm_ms, old_block_height, new_block_height, created_at_ms)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            stat.reorg_tm_ms,
            stat.old_block_height,
            stat.new_block_height,
            stat.created_at_ms,
        ],
    )
    .map_err(|e| format!("unable to write reorg_stats: {e}"))?;
    Ok(())
}

pub fn count_reorg_stats(conn: &Connection) -> Result<u64, String> {
    conn.query_row("SELECT COUNT(*) FROM reorg_stats", [], |row| {
        row.get::<_, u64>(0)
    })
    .map_err(|e| format!("unable to query reorg_stats: {e}"))
}

fn inscription_from_row(row: &rusqlite::Row) -> rusqlite::Result<InscriptionRecord> {
    let charms: String = row.get(5)?;
    let tags: String = row.get(6)?;
    let metadata: Option<String> = row.get(16)?;
    Ok(InscriptionRecord {
        inscription_number: row.get(0)?,
        inscription_id: row.get(1)?,
        genesis_height: row.get(2)?,
        sat: row.get(3)?,
        timestamp_ms: row.get(4)?,
        charms: serde_json::from_str(&charms).unwrap_or_default(),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        token: row.get(7)?,
        location: row.get(8)?,
        output: row.get(9)?,
        output_value: row.get(10)?,
        address: row.get(11)?,
        content_type: row.get(12)?,
        content: row.get(13)?,
        sha: row.get(14)?,
        delegate: row.get(15)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        metaprotocol: row.get(17)?,
        parent: row.get(18)?,
    })
}

const INSCRIPTION_COLUMNS: &str = "inscription_number, inscription_id, genesis_height, sat, timestamp_ms, charms, tags, token, location, output, output_value, address, content_type, content, sha, delegate, metadata, metaprotocol, parent";

pub fn find_inscription_with_id(
    inscription_id: &str,
    conn: &Connection,
) -> Result<Option<InscriptionRecord>, String> {
    let query = format!("SELECT {INSCRIPTION_COLUMNS} FROM inscriptions WHERE inscription_id = ?1");
    match conn.query_row(&query, rusqlite::params![inscription_id], |row| {
        inscription_from_row(row)
    }) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(format!("unable to query inscriptions: {e}")),
    }
}

pub fn find_all_inscription_numbers(conn: &Connection) -> Result<Vec<i64>, String> {
    let mut statement = conn
        .prepare("SELECT inscription_number FROM inscriptions ORDER BY inscription_number ASC")
        .map_err(|e| format!("unable to query inscriptions: {e}"))?;
    let rows = statement
        .query_map([], |row| row.get::<_, i64>(0))
        .map_err(|e| format!("unable to query inscriptions: {e}"))?;
    let mut numbers = vec![];
    for row in rows {
        numbers.push(row.map_err(|e| format!("unable to query inscriptions: {e}"))?);
    }
    Ok(numbers)
}

/// Storage-hygiene pass: strips optional fields stored at empty values,
/// one bounded page per call. Re-runnable; identity fields are untouched.
pub fn run_compaction_pass(
    page_size: usize,
    conn: &mut Connection,
    ctx: &Context,
) -> Result<usize, String> {
    let query = format!(
        "SELECT {INSCRIPTION_COLUMNS} FROM inscriptions
         WHERE location = '' OR output = '' OR address = '' OR content = ''
            OR content_type = '' OR sha = '' OR delegate = '' OR metaprotocol = ''
            OR parent = '' OR metadata = '{{}}'
            OR (output_value = 0 AND (output IS NULL OR output = ''))
         ORDER BY inscription_number DESC
         LIMIT ?1"
    );
    let mut candidates = vec![];
    {
        let mut statement = conn
            .prepare(&query)
            .map_err(|e| format!("unable to query inscriptions: {e}"))?;
        let rows = statement
            .query_map(rusqlite::params![page_size as u64], |row| {
                inscription_from_row(row)
            })
            .map_err(|e| format!("unable to query inscriptions: {e}"))?;
        for row in rows {
            candidates.push(row.map_err(|e| format!("unable to query inscriptions: {e}"))?);
        }
    }

    let mut compacted = 0;
    let transaction = conn
        .transaction()
        .map_err(|e| format!("unable to open transaction: {e}"))?;
    for mut record in candidates {
        if !compact_record(&mut record) {
            continue;
        }
        transaction
            .execute(
                "UPDATE inscriptions SET
                    location = ?1, output = ?2, output_value = ?3, address = ?4,
                    content_type = ?5, content = ?6, sha = ?7, delegate = ?8,
                    metadata = ?9, metaprotocol = ?10, parent = ?11
                 WHERE inscription_id = ?12",
                rusqlite::params![
                    record.location,
                    record.output,
                    record.output_value,
                    record.address,
                    record.content_type,
                    record.content,
                    record.sha,
                    record.delegate,
                    record
                        .metadata
                        .as_ref()
                        .map(|m| serde_json::to_string(m).unwrap_or_default()),
                    record.metaprotocol,
                    record.parent,
                    record.inscription_id,
                ],
            )
            .map_err(|e| format!("unable to compact inscription: {e}"))?;
        compacted += 1;
    }
    transaction
        .commit()
        .map_err(|e| format!("unable to commit compaction: {e}"))?;
    if compacted > 0 {
        try_debug!(ctx, "Compacted {} inscription rows", compacted);
    }
    Ok(compacted)
}
