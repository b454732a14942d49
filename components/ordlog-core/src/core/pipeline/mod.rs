use std::collections::HashMap;
use std::time::Instant;

use rusqlite::Connection;

use crate::backfill::backfill_skipped_block;
use crate::config::{Config, DEFAULT_MAX_DECODE_ERRORS};
use crate::core::errors::IndexerError;
use crate::core::protocol::block_boundaries::validate_block_boundaries;
use crate::core::protocol::event_decoding::{
    decode_block_index_line, decode_event_line, BlockIndexEntry, Event,
};
use crate::core::protocol::record_building::{BuiltOp, RecordBuilder};
use crate::core::protocol::reorg;
use crate::db::records::TransferUpdate;
use crate::db::{
    apply_transfer_updates, check_indexer_metadata, check_numbering_invariant,
    delete_block_hash_at_block_height, delete_inscriptions_at_block_height,
    find_inscription_id_with_number, find_max_committed_block_height, initialize_ordlog_db,
    insert_block_hash_if_absent, insert_records_batch, run_compaction_pass, NumberingFault,
};
use crate::provider::ProviderClient;
use crate::utils::{file_append, read_log_lines_at_path, truncate_file_at_path, Context};
use crate::{try_error, try_info, try_warn};

#[derive(Debug, Default)]
pub struct CycleReport {
    pub events_decoded: usize,
    pub malformed_lines: usize,
    pub new_inscriptions_declared: usize,
    pub records_written: usize,
    pub transfers_applied: usize,
    pub max_block_height: Option<u64>,
    pub nothing_new: bool,
    pub cycle_tm_ms: u64,
}

/// One full ingestion cycle: reorg reconciliation against the secondary
/// log, then decode → boundary-validate → build → invariant-checked bulk
/// write over the primary log. Both log files are truncated only after every
/// write landed; a cycle that fails leaves them untouched so the next run
/// retries with the same input.
pub fn run_cycle(config: &Config, ctx: &Context) -> Result<CycleReport, IndexerError> {
    let cycle_start = Instant::now();
    let mut report = CycleReport::default();

    let mut conn = initialize_ordlog_db(&config.expected_cache_path(), ctx);
    check_indexer_metadata(&config.network, &conn)?;

    let event_log_path = config.expected_event_log_path();
    let block_index_log_path = config.expected_block_index_log_path();
    let event_lines =
        read_log_lines_at_path(&event_log_path, ctx).map_err(IndexerError::Storage)?;
    let index_lines =
        read_log_lines_at_path(&block_index_log_path, ctx).map_err(IndexerError::Storage)?;

    let index_entries = decode_block_index_entries(&index_lines, ctx);
    if index_entries.is_empty() {
        try_info!(ctx, "Nothing new, waiting");
        report.nothing_new = true;
        return Ok(report);
    }
    report.max_block_height = index_entries.iter().map(|entry| entry.height).max();

    let committed_height =
        find_max_committed_block_height(&conn).map_err(IndexerError::Storage)?;
    let committed_height = reorg::detect_and_reconcile(
        &index_entries,
        committed_height,
        config.first_inscription_height(),
        &conn,
        ctx,
    )?;
    let watermark = committed_height.unwrap_or(0);
    try_info!(
        ctx,
        "Ingesting events above block #{} (target #{})",
        watermark,
        report.max_block_height.unwrap_or(watermark)
    );

    let mut events: Vec<Event> = vec![];
    for line in event_lines.iter() {
        match decode_event_line(line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => {
                report.malformed_lines += 1;
                try_warn!(ctx, "Skipping malformed log line: {}", e);
                if report.malformed_lines > DEFAULT_MAX_DECODE_ERRORS {
                    return Err(IndexerError::StreamCorruption(format!(
                        "{} malformed lines in one cycle, log stream looks corrupted",
                        report.malformed_lines
                    )));
                }
            }
        }
    }
    report.events_decoded = events.len();

    let validated = validate_block_boundaries(events)?;
    if let Some(closed_height) = validated.max_closed_height {
        try_info!(ctx, "Event stream closes at block #{}", closed_height);
    }

    let mut builder = RecordBuilder::new(watermark);
    let mut records = vec![];
    let mut transfer_updates: Vec<TransferUpdate> = vec![];
    // last transfer for a given old output wins within a cycle
    let mut transfer_positions: HashMap<String, usize> = HashMap::new();
    for event in validated.events.iter() {
        if let Event::InsertNumberToId(declaration) = event {
            if declaration.height > watermark {
                report.new_inscriptions_declared += 1;
            }
        }
        match builder.build(event)? {
            Some(BuiltOp::Record(record)) => records.push(record),
            Some(BuiltOp::Transfer(update)) => {
                match transfer_positions.get(&update.old_output) {
                    Some(&position) => transfer_updates[position] = update,
                    None => {
                        transfer_positions.insert(update.old_output.clone(), transfer_updates.len());
                        transfer_updates.push(update);
                    }
                }
            }
            None => {}
        }
    }

    records.sort_by_key(|record| record.inscription_number);

    if let Err(fault) = check_numbering_invariant(&records, &conn) {
        return Err(repair_numbering_gap(fault, &mut conn, config, ctx));
    }

    // Inserts land before transfers so an inscription created and moved
    // within the same cycle ends up at its post-transfer location.
    insert_records_batch(&records, &mut conn).map_err(IndexerError::Storage)?;
    report.records_written = records.len();
    report.transfers_applied =
        apply_transfer_updates(&transfer_updates, &mut conn).map_err(IndexerError::Storage)?;

    for reject in builder.drain_nul_rejects() {
        let line = format!(
            "{}\t{}\n",
            reject.inscription_id,
            reject.payload.replace('\u{0000}', "\\u0000")
        );
        let _ = file_append(&config.expected_nul_side_channel_path(), line.as_bytes(), ctx);
    }

    run_compaction_pass(config.resources.compaction_page_size, &mut conn, ctx)
        .map_err(IndexerError::Storage)?;

    for entry in index_entries.iter() {
        if entry.height < config.first_inscription_height() {
            continue;
        }
        insert_block_hash_if_absent(entry.height, &entry.hash, &conn)
            .map_err(IndexerError::Storage)?;
    }

    // Truncation is the commit signal for log consumption.
    truncate_file_at_path(&event_log_path).map_err(IndexerError::Storage)?;
    truncate_file_at_path(&block_index_log_path).map_err(IndexerError::Storage)?;

    report.cycle_tm_ms = cycle_start.elapsed().as_millis() as u64;
    try_info!(
        ctx,
        "Cycle complete: {} events, {} records written, {} transfers applied, {} declared, {}ms",
        report.events_decoded,
        report.records_written,
        report.transfers_applied,
        report.new_inscriptions_declared,
        report.cycle_tm_ms
    );
    Ok(report)
}

fn decode_block_index_entries(lines: &[String], ctx: &Context) -> Vec<BlockIndexEntry> {
    let mut entries = vec![];
    for line in lines.iter() {
        match decode_block_index_line(line) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(e) => {
                try_warn!(ctx, "Skipping malformed block index line: {}", e);
            }
        }
    }
    entries
}

/// A numbering gap means the external process skipped emitting inscriptions
/// for a block, most commonly a block the primary path dropped records from.
/// The implicated heights are rebuilt from the fallback provider, then the
/// cycle still fails loudly so the caller never continues past the gap. A
/// gap backfill cannot close escalates to a fatal condition; only transient
/// provider faults stay retryable.
fn repair_numbering_gap(
    fault: NumberingFault,
    conn: &mut Connection,
    config: &Config,
    ctx: &Context,
) -> IndexerError {
    let provider = match ProviderClient::new(&config.provider) {
        Ok(provider) => provider,
        Err(e) => return IndexerError::Configuration(e),
    };
    match fault {
        NumberingFault::GapAtStart { number, height } => {
            try_warn!(
                ctx,
                "Record with number {} missing below the batch at block #{}",
                number - 1,
                height
            );
            let prior_height = height.saturating_sub(1);
            // The prior height is suspect: clear its commit marker and
            // records, then rebuild it before failing the cycle.
            let _ = delete_block_hash_at_block_height(prior_height, conn);
            let _ = delete_inscriptions_at_block_height(prior_height, conn);
            if let Err(e) = backfill_skipped_block(prior_height, &provider, conn, config, ctx) {
                try_error!(ctx, "Backfill of block #{} failed: {}", prior_height, e);
                return escalate_unrepaired_gap(prior_height, e);
            }
            // The missing number can also sit in the batch's own block when
            // the primary path dropped records there; rebuild it too if the
            // predecessor is still absent.
            let repaired = find_inscription_id_with_number(number - 1, conn).unwrap_or(None);
            if repaired.is_none() {
                if let Err(e) = backfill_skipped_block(height, &provider, conn, config, ctx) {
                    try_error!(ctx, "Backfill of block #{} failed: {}", height, e);
                    return escalate_unrepaired_gap(height, e);
                }
            }
            IndexerError::NumberingGap {
                height,
                expected: number - 1,
                found: number,
            }
        }
        NumberingFault::GapMidBatch {
            expected,
            found,
            prev_height,
            height,
        } => {
            try_warn!(
                ctx,
                "Batch not consecutive between blocks #{} and #{}: expected {}, found {}",
                prev_height,
                height,
                expected,
                found
            );
            for implicated_height in prev_height..=height {
                if let Err(e) =
                    backfill_skipped_block(implicated_height, &provider, conn, config, ctx)
                {
                    try_error!(ctx, "Backfill of block #{} failed: {}", implicated_height, e);
                    return escalate_unrepaired_gap(implicated_height, e);
                }
            }
            IndexerError::NumberingGap {
                height,
                expected,
                found,
            }
        }
    }
}

fn escalate_unrepaired_gap(height: u64, e: IndexerError) -> IndexerError {
    match e {
        // A down provider is retried on the next tick, not escalated.
        provider_fault @ IndexerError::Provider(_) => provider_fault,
        e => IndexerError::InvariantViolation(format!(
            "numbering gap at block #{height} could not be repaired by backfill: {e}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EventLogConfig, LogConfig, Network, ProviderConfig, ResourcesConfig, StorageConfig,
    };
    use crate::db::{
        find_all_inscription_numbers, find_block_hash_at_block_height, insert_indexer_metadata,
    };
    use crate::utils::write_file_content_at_path;
    use std::path::PathBuf;

    fn test_config(name: &str) -> Config {
        let mut base = std::env::temp_dir();
        base.push(format!("ordlog-pipeline-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        let mut working_dir = base.clone();
        working_dir.push("cache");
        let mut ord_dir = base.clone();
        ord_dir.push("ord");
        Config {
            storage: StorageConfig {
                working_dir: working_dir.display().to_string(),
            },
            event_log: EventLogConfig {
                ord_working_dir: ord_dir.display().to_string(),
            },
            provider: ProviderConfig {
                base_url: "http://localhost:1".into(),
                request_timeout_secs: 1,
                max_attempts: 1,
            },
            resources: ResourcesConfig {
                cpu_core_available: 4,
                backfill_batch_size: 500,
                cycle_cooldown_secs: 0,
                compaction_page_size: 10_000,
            },
            network: Network::Regtest,
            logs: LogConfig {
                ingestion_internals: false,
            },
        }
    }

    fn seed_metadata(config: &Config) {
        let ctx = Context::empty();
        let conn = initialize_ordlog_db(&config.expected_cache_path(), &ctx);
        insert_indexer_metadata(&config.network, &conn).unwrap();
    }

    fn write_logs(config: &Config, event_lines: &[String], index_lines: &[String]) {
        write_file_content_at_path(
            &config.expected_event_log_path(),
            event_lines.join("\n").as_bytes(),
        )
        .unwrap();
        write_file_content_at_path(
            &config.expected_block_index_log_path(),
            index_lines.join("\n").as_bytes(),
        )
        .unwrap();
    }

    fn content_line(height: u64, number: i64, id_char: char) -> String {
        let txid: String = std::iter::repeat(id_char).take(64).collect();
        let location_txid: String = std::iter::repeat('b').take(64).collect();
        let sha: String = std::iter::repeat('c').take(64).collect();
        [
            "cmd".to_string(),
            format!("height:{height}"),
            "insert".to_string(),
            "content".to_string(),
            format!("number:{number}"),
            format!("id:{txid}i0"),
            "is_json:false".to_string(),
            "content_type:text/plain".to_string(),
            "metaprotocol:".to_string(),
            format!("content:hello {number}"),
            "parents:".to_string(),
            format!("sat:Some(Sat({}))", 5000 + number),
            "timestamp:1700000000".to_string(),
            format!(
                "location:SatPoint {{ outpoint: OutPoint {{ txid: 0x{location_txid}, vout: {number} }}, offset: 0 }}"
            ),
            "charms:0".to_string(),
            "output_value:546".to_string(),
            "address:\"bcrt1qexample\"".to_string(),
            "delegate:None".to_string(),
            format!("sha:Some({sha})"),
            "rune:None".to_string(),
            "metadata:None".to_string(),
        ]
        .join("~||~")
    }

    #[test]
    fn a_full_cycle_ingests_commits_and_truncates() {
        let config = test_config("full-cycle");
        seed_metadata(&config);
        write_logs(
            &config,
            &[
                "cmd~||~height:100~||~block_start".to_string(),
                content_line(100, 0, 'a'),
                content_line(100, 1, 'd'),
                "cmd~||~height:100~||~block_end".to_string(),
            ],
            &["cmd;100;new_block;hash-100".to_string()],
        );

        let ctx = Context::empty();
        let report = run_cycle(&config, &ctx).unwrap();
        assert!(!report.nothing_new);
        assert_eq!(report.records_written, 2);
        assert_eq!(report.max_block_height, Some(100));

        let conn = initialize_ordlog_db(&config.expected_cache_path(), &ctx);
        assert_eq!(find_all_inscription_numbers(&conn).unwrap(), vec![0, 1]);
        assert_eq!(
            find_block_hash_at_block_height(100, &conn).unwrap(),
            Some("hash-100".to_string())
        );

        // commit signal: both logs truncated
        let event_log = std::fs::read_to_string(config.expected_event_log_path()).unwrap();
        let index_log = std::fs::read_to_string(config.expected_block_index_log_path()).unwrap();
        assert!(event_log.is_empty());
        assert!(index_log.is_empty());
    }

    fn transfer_line(height: u64, id_char: char, old_vout: u32) -> String {
        let txid: String = std::iter::repeat(id_char).take(64).collect();
        let old_txid: String = std::iter::repeat('b').take(64).collect();
        let new_txid: String = std::iter::repeat('f').take(64).collect();
        [
            "cmd".to_string(),
            format!("height:{height}"),
            "insert".to_string(),
            "transfer".to_string(),
            format!("id:{txid}i0"),
            format!("old_satpoint:{old_txid}:{old_vout}:0"),
            format!("new_satpoint:{new_txid}:0:12"),
            "sent_as_fee:false".to_string(),
            "new_pkscript:0014abcd".to_string(),
            "new_output_value:9000".to_string(),
            "new_address:\"bcrt1qdest\"".to_string(),
            "timestamp:1700000100".to_string(),
        ]
        .join("~||~")
    }

    #[test]
    fn a_record_created_and_transferred_in_one_cycle_lands_at_its_new_output() {
        let config = test_config("create-and-transfer");
        seed_metadata(&config);
        write_logs(
            &config,
            &[
                "cmd~||~height:100~||~block_start".to_string(),
                content_line(100, 0, 'a'),
                transfer_line(100, 'a', 0),
                "cmd~||~height:100~||~block_end".to_string(),
            ],
            &["cmd;100;new_block;hash-100".to_string()],
        );

        let ctx = Context::empty();
        let report = run_cycle(&config, &ctx).unwrap();
        assert_eq!(report.records_written, 1);
        assert_eq!(report.transfers_applied, 1);

        let conn = initialize_ordlog_db(&config.expected_cache_path(), &ctx);
        let new_txid: String = std::iter::repeat('f').take(64).collect();
        let id = format!("{}i0", "a".repeat(64));
        let record = crate::db::find_inscription_with_id(&id, &conn)
            .unwrap()
            .unwrap();
        assert_eq!(record.output.as_deref(), Some(format!("{new_txid}:0").as_str()));
        assert_eq!(
            record.location.as_deref(),
            Some(format!("{new_txid}:0:12").as_str())
        );
        assert_eq!(record.output_value, Some(9000));
        assert_eq!(record.address.as_deref(), Some("bcrt1qdest"));
    }

    #[test]
    fn a_numbering_gap_aborts_the_write_phase_without_committing() {
        let config = test_config("numbering-gap");
        seed_metadata(&config);
        // number 7 with an empty store: the predecessor is missing and the
        // provider at localhost:1 is unreachable, so repair cannot proceed
        write_logs(
            &config,
            &[
                "cmd~||~height:101~||~block_start".to_string(),
                content_line(101, 7, 'a'),
                "cmd~||~height:101~||~block_end".to_string(),
            ],
            &["cmd;101;new_block;hash-101".to_string()],
        );

        let ctx = Context::empty();
        let result = run_cycle(&config, &ctx);
        assert!(matches!(result, Err(IndexerError::Provider(_))));

        let conn = initialize_ordlog_db(&config.expected_cache_path(), &ctx);
        assert!(find_all_inscription_numbers(&conn).unwrap().is_empty());
        assert_eq!(find_block_hash_at_block_height(101, &conn).unwrap(), None);
        // logs stay unconsumed so the next cycle retries with fresh input
        let event_log = std::fs::read_to_string(config.expected_event_log_path()).unwrap();
        assert!(!event_log.is_empty());
    }

    #[test]
    fn empty_block_index_log_short_circuits() {
        let config = test_config("nothing-new");
        seed_metadata(&config);
        write_logs(&config, &[], &[]);
        let ctx = Context::empty();
        let report = run_cycle(&config, &ctx).unwrap();
        assert!(report.nothing_new);
    }

    #[test]
    fn missing_version_marker_refuses_to_run() {
        let config = test_config("no-marker");
        let ctx = Context::empty();
        // open the db without writing the marker
        let _ = initialize_ordlog_db(&config.expected_cache_path(), &ctx);
        write_logs(&config, &[], &["cmd;100;new_block;hash".to_string()]);
        let result = run_cycle(&config, &ctx);
        assert!(matches!(result, Err(IndexerError::VersionMismatch(_))));
    }

    #[test]
    fn corrupted_stream_leaves_the_logs_unconsumed() {
        let config = test_config("corruption");
        seed_metadata(&config);
        write_logs(
            &config,
            &[
                "cmd~||~height:100~||~block_start".to_string(),
                content_line(100, 0, 'a'),
            ],
            &["cmd;100;new_block;hash-100".to_string()],
        );
        let ctx = Context::empty();
        let result = run_cycle(&config, &ctx);
        assert!(matches!(result, Err(IndexerError::StreamCorruption(_))));

        // watermark not advanced, logs left for inspection
        let conn = initialize_ordlog_db(&config.expected_cache_path(), &ctx);
        assert_eq!(find_block_hash_at_block_height(100, &conn).unwrap(), None);
        let event_log = std::fs::read_to_string(config.expected_event_log_path()).unwrap();
        assert!(!event_log.is_empty());
    }

    #[test]
    fn rerunning_the_same_cycle_input_is_idempotent() {
        let config = test_config("idempotent");
        seed_metadata(&config);
        let event_lines = vec![
            "cmd~||~height:100~||~block_start".to_string(),
            content_line(100, 0, 'a'),
            "cmd~||~height:100~||~block_end".to_string(),
        ];
        let index_lines = vec!["cmd;100;new_block;hash-100".to_string()];
        let ctx = Context::empty();

        write_logs(&config, &event_lines, &index_lines);
        run_cycle(&config, &ctx).unwrap();
        // the same batch replayed after a partial failure must be a no-op
        write_logs(&config, &event_lines, &index_lines);
        run_cycle(&config, &ctx).unwrap();

        let conn = initialize_ordlog_db(&config.expected_cache_path(), &ctx);
        assert_eq!(find_all_inscription_numbers(&conn).unwrap(), vec![0]);
    }

    #[test]
    fn paths_are_derived_from_the_network_folder() {
        let config = test_config("paths");
        let event_log: PathBuf = config.expected_event_log_path();
        assert!(event_log.ends_with("regtest/inscriptions.txt"));
    }
}
