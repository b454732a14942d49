use regex::Regex;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use threadpool::ThreadPool;

use crate::config::Config;
use crate::core::errors::IndexerError;
use crate::core::protocol::record_building::{
    assemble_record, finalize_tags_with_content_type, is_textual_content_type, RecordParts,
};
use crate::db::records::InscriptionRecord;
use crate::db::{
    check_numbering_invariant, count_inscriptions_at_block_height, delete_inscriptions_at_block_height,
    find_existing_inscription_ids, insert_block_hash_if_absent, insert_records_batch,
    NumberingFault,
};
use crate::ord::charm::Charm;
use crate::provider::{ContentResponse, InscriptionDetail, ProviderClient};
use crate::utils::Context;
use crate::{try_info, try_warn};

lazy_static! {
    // Streams too large to be worth hashing; everything else gets a sha so
    // duplicate content stays detectable.
    static ref UNHASHED_CONTENT_RE: Regex = Regex::new(r"video|audio").unwrap();
}

/// Reconstructs the index entries for a height the primary event stream
/// skipped, pulling the inscription list and per-inscription detail from the
/// fallback provider. Recording the block hash is the commit signal that the
/// height is done; it is never written when the per-height record count does
/// not match the provider's count.
pub fn backfill_skipped_block(
    block_height: u64,
    provider: &ProviderClient,
    conn: &mut Connection,
    config: &Config,
    ctx: &Context,
) -> Result<(), IndexerError> {
    check_previous_block(block_height, provider, conn, ctx)?;

    let listing = hiro_system_kit::nestable_block_on(provider.get_block(block_height, ctx))?;
    try_info!(
        ctx,
        "Backfilling block #{} ({} inscriptions declared by provider)",
        block_height,
        listing.inscriptions.len()
    );

    if listing.inscriptions.is_empty() {
        // Zero inscriptions is itself the resolution for this height.
        insert_block_hash_if_absent(block_height, &listing.hash, conn)
            .map_err(IndexerError::Storage)?;
        return Ok(());
    }

    let existing =
        find_existing_inscription_ids(&listing.inscriptions, conn).map_err(IndexerError::Storage)?;
    let missing: Vec<String> = listing
        .inscriptions
        .iter()
        .filter(|id| !existing.contains(*id))
        .cloned()
        .collect();

    let mut failed: Vec<(String, String)> = vec![];
    let mut records: Vec<InscriptionRecord> = vec![];

    if !missing.is_empty() {
        let pool = ThreadPool::new(config.resources.get_optimal_thread_pool_capacity());
        for batch in missing.chunks(config.resources.backfill_batch_size) {
            let (record_tx, record_rx) = crossbeam_channel::bounded(batch.len());
            for inscription_id in batch.iter() {
                let record_tx = record_tx.clone();
                let inscription_id = inscription_id.clone();
                let moved_provider = provider.clone();
                let moved_ctx = ctx.clone();
                pool.execute(move || {
                    let result = hiro_system_kit::nestable_block_on(fetch_and_build(
                        &moved_provider,
                        &inscription_id,
                        &moved_ctx,
                    ));
                    let _ = record_tx.send((inscription_id, result));
                });
            }
            drop(record_tx);
            while let Ok((inscription_id, result)) = record_rx.recv() {
                match result {
                    Ok(record) => records.push(record),
                    Err(reason) => {
                        // One id's failure must not abort the batch, but it
                        // is surfaced, never silently dropped.
                        try_warn!(
                            ctx,
                            "Unable to backfill inscription {}: {}",
                            inscription_id,
                            reason
                        );
                        failed.push((inscription_id, reason));
                    }
                }
            }
        }
        pool.join();
    }

    records.sort_by_key(|record| record.inscription_number);

    if let Err(fault) = check_numbering_invariant(&records, conn) {
        return Err(IndexerError::BackfillFailure {
            height: block_height,
            reason: describe_numbering_fault(&fault),
        });
    }

    if !records.is_empty() {
        insert_records_batch(&records, conn).map_err(IndexerError::Storage)?;
    }

    let mismatch = verify_and_record_block_hash(
        block_height,
        &listing.hash,
        listing.inscriptions.len() as u64,
        conn,
    )
    .map_err(IndexerError::Storage)?;
    if let Some(indexed) = mismatch {
        let mut reason = format!(
            "{} of {} inscriptions indexed",
            indexed,
            listing.inscriptions.len()
        );
        if !failed.is_empty() {
            reason.push_str(&format!(
                "; {} fetches failed ({})",
                failed.len(),
                failed
                    .iter()
                    .map(|(id, _)| id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        return Err(IndexerError::BackfillFailure {
            height: block_height,
            reason,
        });
    }

    try_info!(
        ctx,
        "Backfilled block #{} ({} records)",
        block_height,
        listing.inscriptions.len()
    );
    Ok(())
}

/// Recording the block hash marks the height done. The per-height record
/// count must match the provider's declared count first; on mismatch the
/// hash is not written and the actual count is returned.
fn verify_and_record_block_hash(
    block_height: u64,
    block_hash: &str,
    expected_count: u64,
    conn: &Connection,
) -> Result<Option<u64>, String> {
    let indexed = count_inscriptions_at_block_height(block_height, conn)?;
    if indexed != expected_count {
        return Ok(Some(indexed));
    }
    insert_block_hash_if_absent(block_height, block_hash, conn)?;
    Ok(None)
}

/// Backfill never proceeds on top of known-bad state: the previous height
/// must already hold exactly the record count the provider declares for it.
/// On mismatch the previous height is cleared so a retry can rebuild it
/// first.
fn check_previous_block(
    block_height: u64,
    provider: &ProviderClient,
    conn: &mut Connection,
    ctx: &Context,
) -> Result<(), IndexerError> {
    let previous_height = match block_height.checked_sub(1) {
        Some(previous_height) => previous_height,
        None => return Ok(()),
    };
    let indexed =
        count_inscriptions_at_block_height(previous_height, conn).map_err(IndexerError::Storage)?;
    let listing = hiro_system_kit::nestable_block_on(provider.get_block(previous_height, ctx))?;
    if indexed != listing.inscriptions.len() as u64 {
        delete_inscriptions_at_block_height(previous_height, conn)
            .map_err(IndexerError::Storage)?;
        return Err(IndexerError::BackfillFailure {
            height: block_height,
            reason: format!(
                "previous block #{} is incomplete ({} indexed, provider declares {}); cleared for rebuild",
                previous_height,
                indexed,
                listing.inscriptions.len()
            ),
        });
    }
    Ok(())
}

async fn fetch_and_build(
    provider: &ProviderClient,
    inscription_id: &str,
    ctx: &Context,
) -> Result<InscriptionRecord, String> {
    // Content fetch failures are tolerated per id; the detail fetch is not.
    let content = provider.get_content(inscription_id, ctx).await.ok();
    let detail = provider
        .get_inscription(inscription_id, ctx)
        .await
        .map_err(|e| e.to_string())?;
    build_record_from_provider(inscription_id, detail, content)
}

/// Synthesizes a record equivalent to what the primary pipeline would have
/// produced, from the provider-shaped payload. Unlike the primary path,
/// token-classified records are kept: backfill is the completeness
/// mechanism and must account for every declared inscription.
pub fn build_record_from_provider(
    inscription_id: &str,
    detail: InscriptionDetail,
    content: Option<ContentResponse>,
) -> Result<InscriptionRecord, String> {
    if detail.genesis_height == 0 {
        return Err(format!(
            "genesis height missing for inscription {inscription_id}"
        ));
    }
    let sat = detail
        .sat
        .ok_or_else(|| format!("sat missing for inscription {inscription_id}"))?;

    let content_type = content
        .as_ref()
        .and_then(|response| response.content_type.clone())
        .or_else(|| detail.content_type.clone());

    let mut text_content = None;
    let mut sha = None;
    if let (Some(response), Some(content_type)) = (&content, content_type.as_deref()) {
        if is_textual_content_type(content_type) {
            let body = String::from_utf8_lossy(&response.bytes).to_string();
            sha = Some(hex::encode(Sha256::digest(body.as_bytes())));
            text_content = Some(body);
        } else if !UNHASHED_CONTENT_RE.is_match(content_type) {
            sha = Some(hex::encode(Sha256::digest(&response.bytes)));
        }
    }

    let location = detail.satpoint.clone();
    let output = location.as_deref().map(drop_satpoint_offset);

    let mut record = assemble_record(RecordParts {
        inscription_number: detail.inscription_number,
        inscription_id: inscription_id.to_string(),
        genesis_height: detail.genesis_height,
        sat,
        timestamp_ms: detail.timestamp.map(|seconds| seconds * 1000).unwrap_or(0),
        charms: parse_provider_charms(&detail.charms),
        location,
        output,
        output_value: detail.output_value,
        address: detail.address.clone(),
        content_type: content_type.clone(),
        content: text_content,
        sha,
        delegate: None,
        metadata: detail.metadata.clone(),
        metaprotocol: detail.metaprotocol.clone(),
        parent: detail.parent.clone(),
        is_json: content_type
            .as_deref()
            .map_or(false, |content_type| content_type.contains("json")),
    });
    // Provider-derived records carry the content-type parts as searchable
    // tags; the primary stream path does not.
    record.tags = finalize_tags_with_content_type(record.tags, content_type.as_deref());
    Ok(record)
}

fn parse_provider_charms(names: &[String]) -> Vec<Charm> {
    names
        .iter()
        .filter_map(|name| name.parse::<Charm>().ok())
        .collect()
}

fn drop_satpoint_offset(satpoint: &str) -> String {
    match satpoint.rsplit_once(':') {
        Some((output, _offset)) => output.to_string(),
        None => satpoint.to_string(),
    }
}

fn describe_numbering_fault(fault: &NumberingFault) -> String {
    match fault {
        NumberingFault::GapAtStart { number, height } => format!(
            "record with number {} is missing below the batch starting at block #{}",
            number - 1,
            height
        ),
        NumberingFault::GapMidBatch {
            expected, found, ..
        } => format!("batch is not consecutive: expected {expected}, found {found}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ContentResponse, InscriptionDetail};

    fn detail(number: i64, height: u64) -> InscriptionDetail {
        InscriptionDetail {
            inscription_number: number,
            genesis_height: height,
            address: Some("bc1qexample".to_string()),
            satpoint: Some("abc:0:330".to_string()),
            sat: Some(5_000_000_000),
            timestamp: Some(1_700_000_000),
            output_value: Some(546),
            charms: vec!["cursed".to_string()],
            metadata: None,
            metaprotocol: None,
            content_type: None,
            parent: None,
        }
    }

    fn text_content(body: &str) -> ContentResponse {
        ContentResponse {
            bytes: body.as_bytes().to_vec(),
            content_type: Some("text/plain".to_string()),
        }
    }

    #[test]
    fn synthesizes_a_record_from_provider_payloads() {
        let record = build_record_from_provider(
            &format!("{}i0", "a".repeat(64)),
            detail(42, 840000),
            Some(text_content("hello")),
        )
        .unwrap();
        assert_eq!(record.inscription_number, 42);
        assert_eq!(record.genesis_height, 840000);
        assert_eq!(record.location.as_deref(), Some("abc:0:330"));
        assert_eq!(record.output.as_deref(), Some("abc:0"));
        assert_eq!(record.timestamp_ms, 1_700_000_000_000);
        assert_eq!(record.charms, vec![Charm::Cursed]);
        assert_eq!(record.content.as_deref(), Some("hello"));
        assert_eq!(
            record.sha.as_deref(),
            Some(hex::encode(Sha256::digest(b"hello")).as_str())
        );
        assert!(!record.token);
        // content-type parts become tags on this path only
        assert_eq!(record.tags, vec!["text".to_string(), "plain".to_string()]);
    }

    #[test]
    fn token_records_are_kept_by_backfill() {
        let record = build_record_from_provider(
            &format!("{}i0", "a".repeat(64)),
            detail(42, 840000),
            Some(ContentResponse {
                bytes: br#"{"p":"brc-20","op":"mint","tick":"ordi","amt":"1000"}"#.to_vec(),
                content_type: Some("application/json".to_string()),
            }),
        )
        .unwrap();
        assert!(record.token);
        assert!(record.tags.iter().any(|tag| tag == "brc-20"));
        // token records never retain raw content or hash
        assert_eq!(record.content, None);
        assert_eq!(record.sha, None);
    }

    #[test]
    fn missing_genesis_height_is_an_error() {
        let result = build_record_from_provider(
            &format!("{}i0", "a".repeat(64)),
            detail(42, 0),
            Some(text_content("hello")),
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_sat_is_an_error() {
        let mut detail = detail(42, 840000);
        detail.sat = None;
        let result = build_record_from_provider(
            &format!("{}i0", "a".repeat(64)),
            detail,
            Some(text_content("hello")),
        );
        assert!(result.is_err());
    }

    #[test]
    fn binary_non_media_content_is_hashed_but_not_retained() {
        let record = build_record_from_provider(
            &format!("{}i0", "a".repeat(64)),
            detail(42, 840000),
            Some(ContentResponse {
                bytes: vec![0xde, 0xad, 0xbe, 0xef],
                content_type: Some("application/octet-stream".to_string()),
            }),
        )
        .unwrap();
        assert_eq!(record.content, None);
        assert_eq!(
            record.sha.as_deref(),
            Some(hex::encode(Sha256::digest([0xde, 0xad, 0xbe, 0xef])).as_str())
        );
    }

    #[test]
    fn media_content_is_neither_hashed_nor_retained() {
        let record = build_record_from_provider(
            &format!("{}i0", "a".repeat(64)),
            detail(42, 840000),
            Some(ContentResponse {
                bytes: vec![1, 2, 3],
                content_type: Some("video/mp4".to_string()),
            }),
        )
        .unwrap();
        assert_eq!(record.content, None);
        assert_eq!(record.sha, None);
    }

    #[test]
    fn block_hash_is_only_recorded_when_the_count_matches() {
        use crate::db::records::record_fixture;
        use crate::db::{find_block_hash_at_block_height, initialize_tables, insert_records_batch};
        use crate::utils::Context;

        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        initialize_tables(&conn, &Context::empty());
        insert_records_batch(
            &[record_fixture(0, 840000), record_fixture(1, 840000)],
            &mut conn,
        )
        .unwrap();

        // provider declares 3, only 2 indexed: no hash may exist
        let mismatch = verify_and_record_block_hash(840000, "hash-840000", 3, &conn).unwrap();
        assert_eq!(mismatch, Some(2));
        assert_eq!(find_block_hash_at_block_height(840000, &conn).unwrap(), None);

        // counts agree: the hash write is the commit signal
        let mismatch = verify_and_record_block_hash(840000, "hash-840000", 2, &conn).unwrap();
        assert_eq!(mismatch, None);
        assert_eq!(
            find_block_hash_at_block_height(840000, &conn).unwrap(),
            Some("hash-840000".to_string())
        );
    }

    #[test]
    fn unknown_charm_names_are_skipped() {
        assert_eq!(
            parse_provider_charms(&[
                "cursed".to_string(),
                "sparkly".to_string(),
                "mythic".to_string()
            ]),
            vec![Charm::Cursed, Charm::Mythic]
        );
    }
}
