use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::ord::charm::Charm;

/// Durable unit of the index. Created once at first observation (from the
/// primary event stream or from backfill), mutated only by idempotent
/// upsert-by-id, deleted only during rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InscriptionRecord {
    pub inscription_number: i64,
    pub inscription_id: String,
    pub genesis_height: u64,
    pub sat: u64,
    pub timestamp_ms: i64,
    pub charms: Vec<Charm>,
    pub tags: Vec<String>,
    pub token: bool,
    pub location: Option<String>,
    pub output: Option<String>,
    pub output_value: Option<u64>,
    pub address: Option<String>,
    pub content_type: Option<String>,
    pub content: Option<String>,
    pub sha: Option<String>,
    pub delegate: Option<String>,
    pub metadata: Option<BTreeMap<String, JsonValue>>,
    pub metaprotocol: Option<String>,
    pub parent: Option<String>,
}

/// Ownership update derived from a non-fee transfer event. Applied to the
/// record currently sitting at `old_output`; never an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferUpdate {
    pub block_height: u64,
    pub old_output: String,
    pub new_location: String,
    pub new_output: String,
    pub new_output_value: u64,
    pub new_address: Option<String>,
    pub timestamp_ms: i64,
}

/// Write-once audit entry recorded for every confirmed reorg.
#[derive(Debug, Clone, PartialEq)]
pub struct ReorgStat {
    pub reorg_tm_ms: u64,
    pub old_block_height: u64,
    pub new_block_height: u64,
    pub created_at_ms: u64,
}

/// Strips optional fields present at an empty value, leaving required fields
/// and everything participating in the numbering invariant untouched.
/// Returns whether the record changed, so the storage pass only rewrites
/// rows that need it. Safe to re-run.
pub fn compact_record(record: &mut InscriptionRecord) -> bool {
    let mut changed = false;

    for field in [
        &mut record.location,
        &mut record.output,
        &mut record.address,
        &mut record.content_type,
        &mut record.content,
        &mut record.sha,
        &mut record.delegate,
        &mut record.metaprotocol,
        &mut record.parent,
    ] {
        if matches!(field.as_deref(), Some("")) {
            *field = None;
            changed = true;
        }
    }

    if record
        .metadata
        .as_ref()
        .map(|metadata| metadata.is_empty())
        .unwrap_or(false)
    {
        record.metadata = None;
        changed = true;
    }

    if record.output_value == Some(0) && record.output.is_none() {
        record.output_value = None;
        changed = true;
    }

    changed
}

#[cfg(test)]
pub(crate) fn record_fixture(number: i64, height: u64) -> InscriptionRecord {
    InscriptionRecord {
        inscription_number: number,
        inscription_id: format!("{:0>64}i0", number),
        genesis_height: height,
        sat: 5_000_000_000,
        timestamp_ms: 1_700_000_000_000,
        charms: vec![],
        tags: vec![],
        token: false,
        location: Some("abc:0:0".to_string()),
        output: Some("abc:0".to_string()),
        output_value: Some(546),
        address: Some("bc1qexample".to_string()),
        content_type: Some("text/plain".to_string()),
        content: Some("hello".to_string()),
        sha: Some("c".repeat(64)),
        delegate: None,
        metadata: None,
        metaprotocol: None,
        parent: None,
    }
}
