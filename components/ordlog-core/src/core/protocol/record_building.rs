use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde_json::Value as JsonValue;

use crate::core::errors::IndexerError;
use crate::core::protocol::event_decoding::{ContentEvent, Event, TransferEvent};
use crate::db::records::{InscriptionRecord, TransferUpdate};
use crate::ord::charm::Charm;

/// Raw content is persisted truncated to this many characters.
pub const CONTENT_RETENTION_CAP: usize = 15_000;

lazy_static! {
    static ref TEXTUAL_CONTENT_RE: Regex = Regex::new(r"text|html|json|javascript").unwrap();
    static ref MEDIA_CONTENT_RE: Regex = Regex::new(r"image|audio|zip|video").unwrap();
}

/// Output of the builder for one accepted event.
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltOp {
    Record(InscriptionRecord),
    Transfer(TransferUpdate),
}

/// Deferred sent-as-fee transfer tracking, one state machine per
/// inscription id.
#[derive(Debug, Clone, PartialEq)]
enum FeeTransferState {
    Pending { height: u64 },
    Resolved { height: u64 },
}

/// Content payload containing NUL, routed to a side channel instead of a
/// structured storage field.
#[derive(Debug, Clone, PartialEq)]
pub struct NulReject {
    pub inscription_id: String,
    pub payload: String,
}

pub struct RecordBuilder {
    committed_height: u64,
    fee_transfers: HashMap<String, FeeTransferState>,
    nul_rejects: Vec<NulReject>,
}

impl RecordBuilder {
    pub fn new(committed_height: u64) -> RecordBuilder {
        RecordBuilder {
            committed_height,
            fee_transfers: HashMap::new(),
            nul_rejects: vec![],
        }
    }

    /// Classifies and normalizes one validated event. Events at or below
    /// the committed watermark were processed in a prior run and are
    /// skipped. Returns `None` for events that produce no stored operation.
    pub fn build(&mut self, event: &Event) -> Result<Option<BuiltOp>, IndexerError> {
        match event {
            Event::BlockStart { .. } | Event::BlockEnd { .. } => Ok(None),
            Event::InsertNumberToId(_) => Ok(None),
            Event::InsertTransfer(transfer) => self.build_transfer(transfer),
            Event::InsertContent(content) => Ok(self
                .build_content(content)?
                .map(BuiltOp::Record)),
        }
    }

    pub fn drain_nul_rejects(&mut self) -> Vec<NulReject> {
        std::mem::take(&mut self.nul_rejects)
    }

    fn build_transfer(
        &mut self,
        event: &TransferEvent,
    ) -> Result<Option<BuiltOp>, IndexerError> {
        if event.height <= self.committed_height {
            return Ok(None);
        }
        if event.sent_as_fee {
            // No owner change is persisted for a fee spend; remember it so a
            // later resolution attempt surfaces instead of slipping through.
            self.fee_transfers.insert(
                event.inscription_id.clone(),
                FeeTransferState::Pending {
                    height: event.height,
                },
            );
            return Ok(None);
        }
        match self.fee_transfers.get(&event.inscription_id) {
            Some(FeeTransferState::Resolved { height }) if *height == event.height => {
                return Err(IndexerError::InvariantViolation(format!(
                    "early transfer sent as fee already used for inscription {}",
                    event.inscription_id
                )));
            }
            Some(FeeTransferState::Pending { height }) if *height == event.height => {
                self.fee_transfers.insert(
                    event.inscription_id.clone(),
                    FeeTransferState::Resolved {
                        height: event.height,
                    },
                );
                return Err(IndexerError::InvariantViolation(format!(
                    "transfer resolving a sent-as-fee spend of inscription {} requires operator handling",
                    event.inscription_id
                )));
            }
            _ => {}
        }
        let old_satpoint = match &event.old_satpoint {
            Some(satpoint) => satpoint,
            None => return Ok(None),
        };
        Ok(Some(BuiltOp::Transfer(TransferUpdate {
            block_height: event.height,
            old_output: old_satpoint.output(),
            new_location: event.new_satpoint.to_string(),
            new_output: event.new_satpoint.output(),
            new_output_value: event.new_output_value,
            new_address: event.new_address.clone(),
            timestamp_ms: event.timestamp * 1000,
        })))
    }

    fn build_content(
        &mut self,
        event: &ContentEvent,
    ) -> Result<Option<InscriptionRecord>, IndexerError> {
        if event.height <= self.committed_height {
            return Ok(None);
        }
        let sat = event.sat.ok_or_else(|| {
            IndexerError::InvariantViolation(format!(
                "inscription {} has no sat",
                event.inscription_id
            ))
        })?;
        let location = event.location.as_ref().ok_or_else(|| {
            IndexerError::InvariantViolation(format!(
                "unable to determine location of inscription {}",
                event.inscription_id
            ))
        })?;

        // Delegated inscriptions render their delegate's content.
        let (mut content, sha) = if event.delegate.is_some() {
            (None, None)
        } else {
            (event.content.clone(), event.sha.clone())
        };

        if let Some(body) = &content {
            if body.contains('\u{0000}') {
                self.nul_rejects.push(NulReject {
                    inscription_id: event.inscription_id.clone(),
                    payload: body.clone(),
                });
                content = None;
            }
        }

        let record = assemble_record(RecordParts {
            inscription_number: event.number,
            inscription_id: event.inscription_id.clone(),
            genesis_height: event.height,
            sat,
            timestamp_ms: event.timestamp * 1000,
            charms: Charm::decode(event.charms),
            location: Some(location.to_string()),
            output: Some(location.output()),
            output_value: event.output_value,
            address: event.address.clone(),
            content_type: event.content_type.clone(),
            content,
            sha,
            delegate: event.delegate.clone(),
            metadata: event.metadata.clone(),
            metaprotocol: event.metaprotocol.clone(),
            parent: event.parents.clone(),
            is_json: event.is_json,
        });
        if skips_primary_indexing(&record) {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct Classification {
    pub token: bool,
    pub tags: Vec<String>,
}

/// Detects fungible-token protocols in textual content. Never errors:
/// malformed JSON falls back to the non-token classification.
pub fn classify_content(
    content: Option<&str>,
    is_json: bool,
    content_type: Option<&str>,
    metaprotocol: Option<&str>,
) -> Classification {
    let mut token = false;
    let mut tags: Vec<String> = vec![];

    if let (Some(content_type), Some(body)) = (content_type, content) {
        if TEXTUAL_CONTENT_RE.is_match(content_type) {
            if body.starts_with("cbrc-20:") {
                tags.push("cbrc".to_string());
                tags.push("token".to_string());
                token = true;
            }
            if is_json {
                if let Ok(JsonValue::Object(object)) = serde_json::from_str::<JsonValue>(body) {
                    let protocol = object.get("p").and_then(|value| value.as_str());
                    if protocol == Some("brc-20") {
                        tags.push("brc-20".to_string());
                        tags.push("token".to_string());
                        token = true;
                    } else if protocol.map_or(false, |p| p.contains("sns")) {
                        tags.push("token".to_string());
                        token = true;
                    } else if protocol.map_or(false, |p| p == "brc-21" || p.contains("orc")) {
                        tags.push("token".to_string());
                        token = true;
                    } else if object.contains_key("p")
                        && object.contains_key("tick")
                        && object.contains_key("amt")
                    {
                        tags.push("token".to_string());
                        token = true;
                    } else if object.contains_key("p")
                        && object.contains_key("op")
                        && (object.contains_key("dep")
                            || object.contains_key("tick")
                            || object.contains_key("amt"))
                    {
                        tags.push("token".to_string());
                        tags.push("dmt".to_string());
                        token = true;
                    }
                }
                // Payloads carrying several mints in one body are not valid
                // JSON documents; a raw-text probe still catches them.
                if body.contains(r#""p":"#)
                    && body.contains(r#""op":"#)
                    && (body.contains(r#""tick":"#) || body.contains(r#""amt":"#))
                {
                    if !token {
                        tags.push("token".to_string());
                    }
                    token = true;
                }
            }
        }
    }

    if metaprotocol.map_or(false, |m| m.starts_with("cbrc-20")) {
        token = true;
        tags.push("token".to_string());
        tags.push("cbrc".to_string());
    }

    Classification { token, tags }
}

/// Lowercases and dedupes the classification tags, preserving order.
pub fn finalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut finalized: Vec<String> = vec![];
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() || finalized.contains(&tag) {
            continue;
        }
        finalized.push(tag);
    }
    finalized
}

/// Backfill variant: provider-derived records additionally carry the
/// content-type parts (split on `/`) as searchable tags. The primary
/// stream path never does this.
pub fn finalize_tags_with_content_type(
    tags: Vec<String>,
    content_type: Option<&str>,
) -> Vec<String> {
    let parts = content_type
        .filter(|ct| ct.contains('/'))
        .map(|ct| {
            ct.split('/')
                .map(|part| part.to_string())
                .collect::<Vec<String>>()
        })
        .unwrap_or_default();
    finalize_tags(tags.into_iter().chain(parts).collect())
}

pub struct RecordParts {
    pub inscription_number: i64,
    pub inscription_id: String,
    pub genesis_height: u64,
    pub sat: u64,
    pub timestamp_ms: i64,
    pub charms: Vec<Charm>,
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
    pub is_json: bool,
}

/// Only cbrc-tagged tokens are indexed from the primary stream. Other
/// token-classified inscriptions are dropped here; their absence opens a
/// numbering gap and they re-enter the index through backfill, which keeps
/// them.
pub fn skips_primary_indexing(record: &InscriptionRecord) -> bool {
    record.token && !record.tags.iter().any(|tag| tag == "cbrc")
}

pub fn is_textual_content_type(content_type: &str) -> bool {
    TEXTUAL_CONTENT_RE.is_match(content_type)
}

pub fn is_media_content_type(content_type: &str) -> bool {
    MEDIA_CONTENT_RE.is_match(content_type)
}

/// Applies classification and the content retention policy, producing the
/// normalized record.
pub fn assemble_record(parts: RecordParts) -> InscriptionRecord {
    let classification = classify_content(
        parts.content.as_deref(),
        parts.is_json,
        parts.content_type.as_deref(),
        parts.metaprotocol.as_deref(),
    );
    let token = classification.token;
    let tags = finalize_tags(classification.tags);

    let keep_content = !token
        && parts.content.is_some()
        && parts.sha.is_some()
        && parts
            .content_type
            .as_deref()
            .map_or(false, |content_type| !MEDIA_CONTENT_RE.is_match(content_type));
    let content = if keep_content {
        parts.content.map(truncate_content)
    } else {
        None
    };

    let keep_sha = !token
        && parts.sha.is_some()
        && parts
            .metaprotocol
            .as_deref()
            .map_or(true, |metaprotocol| !metaprotocol.contains("transfer"));
    let sha = if keep_sha { parts.sha } else { None };

    InscriptionRecord {
        inscription_number: parts.inscription_number,
        inscription_id: parts.inscription_id,
        genesis_height: parts.genesis_height,
        sat: parts.sat,
        timestamp_ms: parts.timestamp_ms,
        charms: parts.charms,
        tags,
        token,
        location: parts.location,
        output: parts.output,
        output_value: parts.output_value,
        address: parts.address,
        content_type: parts.content_type,
        content,
        sha,
        delegate: parts.delegate,
        metadata: parts.metadata,
        metaprotocol: parts.metaprotocol,
        parent: parts.parent,
    }
}

fn truncate_content(content: String) -> String {
    if content.chars().count() <= CONTENT_RETENTION_CAP {
        return content;
    }
    content.chars().take(CONTENT_RETENTION_CAP).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::event_decoding::{decode_event_line, FIELD_MARKER};
    use crate::ord::sat_point::SatPoint;
    use test_case::test_case;

    fn txid(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    fn content_event(number: i64, height: u64) -> ContentEvent {
        ContentEvent {
            height,
            number,
            inscription_id: format!("{}i0", txid('a')),
            is_json: false,
            content_type: Some("text/plain".to_string()),
            metaprotocol: None,
            content: Some("hello".to_string()),
            parents: None,
            sat: Some(5),
            timestamp: 1_700_000_000,
            location: Some(SatPoint {
                txid: txid('b'),
                vout: 0,
                offset: 0,
            }),
            charms: 0,
            output_value: Some(546),
            address: Some("bc1qexample".to_string()),
            delegate: None,
            sha: Some(txid('c')),
            metadata: None,
        }
    }

    fn build_one(event: ContentEvent) -> Option<InscriptionRecord> {
        let mut builder = RecordBuilder::new(99);
        match builder
            .build(&Event::InsertContent(event))
            .unwrap()
        {
            Some(BuiltOp::Record(record)) => Some(record),
            Some(other) => panic!("unexpected op: {other:?}"),
            None => None,
        }
    }

    #[test_case(Some(r#"{"p":"brc-20","op":"mint","tick":"ordi","amt":"1000"}"#), true, Some("application/json"), None => (true, vec!["brc-20".to_string(), "token".to_string()]); "brc-20 json")]
    #[test_case(Some("cbrc-20:mint:ordi=1000"), false, Some("text/plain"), None => (true, vec!["cbrc".to_string(), "token".to_string()]); "cbrc prefix")]
    #[test_case(Some(r#"{"p":"sns","name":"x.sats"}"#), true, Some("application/json"), None => (true, vec!["token".to_string()]); "sns protocol")]
    #[test_case(Some(r#"{"p":"orc-20","tick":"x"}"#), true, Some("application/json"), None => (true, vec!["token".to_string()]); "orc protocol")]
    #[test_case(Some(r#"{"p":"tap","op":"dmt-mint","dep":"x"}"#), true, Some("application/json"), None => (true, vec!["token".to_string(), "dmt".to_string()]); "dmt shape")]
    #[test_case(Some("hello world"), false, Some("text/plain"), None => (false, Vec::<String>::new()); "plain text")]
    #[test_case(Some(r#"{"p":"brc-20""#), true, Some("application/json"), None => (false, Vec::<String>::new()); "malformed json never errors")]
    #[test_case(Some(r#"{"p":"brc-20","op":"mint"}"#), true, Some("image/png"), None => (false, Vec::<String>::new()); "non textual content type")]
    #[test_case(None, false, Some("text/plain"), Some("cbrc-20:deploy") => (true, vec!["token".to_string(), "cbrc".to_string()]); "cbrc metaprotocol")]
    #[test_case(Some(r#"{"x":1}"#), true, Some("application/json"), None => (false, Vec::<String>::new()); "unrelated json")]
    fn classification(
        content: Option<&str>,
        is_json: bool,
        content_type: Option<&str>,
        metaprotocol: Option<&str>,
    ) -> (bool, Vec<String>) {
        let classification = classify_content(content, is_json, content_type, metaprotocol);
        (classification.token, classification.tags)
    }

    #[test]
    fn multiple_mints_in_one_payload_classify_as_token() {
        let body = "{\"p\":\"tap\",\"op\":\"token-mint\",\"tick\":\"x\"}\n{\"p\":\"tap\",\"op\":\"token-mint\",\"tick\":\"x\"}";
        let classification =
            classify_content(Some(body), true, Some("application/json"), None);
        assert!(classification.token);
        assert_eq!(classification.tags, vec!["token".to_string()]);
    }

    #[test]
    fn builds_a_plain_text_record() {
        let record = build_one(content_event(42, 100)).unwrap();
        assert_eq!(record.inscription_number, 42);
        assert_eq!(record.genesis_height, 100);
        assert_eq!(record.sat, 5);
        assert_eq!(record.timestamp_ms, 1_700_000_000_000);
        assert_eq!(record.content.as_deref(), Some("hello"));
        assert!(!record.token);
        assert_eq!(record.tags, Vec::<String>::new());
        assert_eq!(record.location.as_deref(), Some(format!("{}:0:0", txid('b')).as_str()));
        assert_eq!(record.output.as_deref(), Some(format!("{}:0", txid('b')).as_str()));
    }

    #[test]
    fn end_to_end_content_line_yields_the_expected_record() {
        let line = [
            "cmd",
            "height:100",
            "insert",
            "content",
            "number:42",
            &format!("id:{}i0", txid('a')),
            "is_json:false",
            "content_type:text/plain",
            "metaprotocol:",
            "content:hello",
            "parents:",
            "sat:Some(Sat(5))",
            "timestamp:1700000000",
            &format!(
                "location:SatPoint {{ outpoint: OutPoint {{ txid: 0x{}, vout: 0 }}, offset: 0 }}",
                txid('b')
            ),
            "charms:0",
            "output_value:546",
            "address:\"bc1qexample\"",
            "delegate:None",
            &format!("sha:Some({})", txid('c')),
            "rune:None",
            "metadata:None",
        ]
        .join(FIELD_MARKER);
        let event = decode_event_line(&line).unwrap().unwrap();
        let mut builder = RecordBuilder::new(99);
        let record = match builder.build(&event).unwrap() {
            Some(BuiltOp::Record(record)) => record,
            other => panic!("unexpected op: {other:?}"),
        };
        assert_eq!(record.inscription_number, 42);
        assert_eq!(record.content.as_deref(), Some("hello"));
        assert_eq!(record.tags, Vec::<String>::new());
        assert!(!record.token);
    }

    #[test]
    fn events_at_or_below_the_committed_height_are_skipped() {
        let mut builder = RecordBuilder::new(100);
        let op = builder
            .build(&Event::InsertContent(content_event(42, 100)))
            .unwrap();
        assert_eq!(op, None);
    }

    #[test]
    fn missing_sat_is_fatal() {
        let mut event = content_event(42, 100);
        event.sat = None;
        let mut builder = RecordBuilder::new(99);
        let result = builder.build(&Event::InsertContent(event));
        assert!(matches!(result, Err(IndexerError::InvariantViolation(_))));
    }

    #[test]
    fn missing_location_is_fatal() {
        let mut event = content_event(42, 100);
        event.location = None;
        let mut builder = RecordBuilder::new(99);
        let result = builder.build(&Event::InsertContent(event));
        assert!(matches!(result, Err(IndexerError::InvariantViolation(_))));
    }

    #[test]
    fn token_records_without_cbrc_tag_are_discarded() {
        let mut event = content_event(42, 100);
        event.is_json = true;
        event.content_type = Some("application/json".to_string());
        event.content =
            Some(r#"{"p":"brc-20","op":"mint","tick":"ordi","amt":"1000"}"#.to_string());
        assert_eq!(build_one(event), None);
    }

    #[test]
    fn cbrc_token_records_keep_no_content_and_no_sha() {
        let mut event = content_event(42, 100);
        event.content = Some("cbrc-20:mint:ordi=1000".to_string());
        let record = build_one(event).unwrap();
        assert!(record.token);
        assert!(record.tags.iter().any(|tag| tag == "cbrc"));
        assert_eq!(record.content, None);
        assert_eq!(record.sha, None);
    }

    #[test]
    fn media_content_types_never_retain_raw_content() {
        for content_type in ["image/png", "audio/mpeg", "video/mp4", "application/zip"] {
            let mut event = content_event(42, 100);
            event.content_type = Some(content_type.to_string());
            event.content = Some("binary-ish".to_string());
            let record = build_one(event).unwrap();
            assert_eq!(record.content, None, "content_type: {content_type}");
        }
    }

    #[test]
    fn content_without_sha_is_not_retained() {
        let mut event = content_event(42, 100);
        event.sha = None;
        let record = build_one(event).unwrap();
        assert_eq!(record.content, None);
    }

    #[test]
    fn transfer_metaprotocol_drops_the_sha() {
        let mut event = content_event(42, 100);
        event.metaprotocol = Some("ns:transfer".to_string());
        let record = build_one(event).unwrap();
        assert_eq!(record.sha, None);
    }

    #[test]
    fn delegated_inscriptions_carry_neither_content_nor_sha() {
        let mut event = content_event(42, 100);
        event.delegate = Some(format!("{}i0", txid('d')));
        let record = build_one(event).unwrap();
        assert_eq!(record.content, None);
        assert_eq!(record.sha, None);
        assert_eq!(record.delegate, Some(format!("{}i0", txid('d'))));
    }

    #[test]
    fn content_is_truncated_to_the_retention_cap() {
        let mut event = content_event(42, 100);
        event.content = Some("x".repeat(CONTENT_RETENTION_CAP + 100));
        let record = build_one(event).unwrap();
        assert_eq!(
            record.content.map(|content| content.chars().count()),
            Some(CONTENT_RETENTION_CAP)
        );
    }

    #[test]
    fn nul_content_is_routed_to_the_side_channel() {
        let mut event = content_event(42, 100);
        event.content = Some("he\u{0000}llo".to_string());
        let mut builder = RecordBuilder::new(99);
        let record = match builder.build(&Event::InsertContent(event)).unwrap() {
            Some(BuiltOp::Record(record)) => record,
            other => panic!("unexpected op: {other:?}"),
        };
        assert_eq!(record.content, None);
        let rejects = builder.drain_nul_rejects();
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].payload, "he\u{0000}llo");
    }

    fn transfer_event(height: u64, sent_as_fee: bool) -> TransferEvent {
        TransferEvent {
            height,
            inscription_id: format!("{}i0", txid('a')),
            old_satpoint: Some(SatPoint {
                txid: txid('e'),
                vout: 1,
                offset: 0,
            }),
            new_satpoint: SatPoint {
                txid: txid('f'),
                vout: 0,
                offset: 12,
            },
            sent_as_fee,
            new_pkscript: "0014abcd".to_string(),
            new_address: Some("bc1qdest".to_string()),
            new_output_value: 9000,
            timestamp: 1_700_000_100,
        }
    }

    #[test]
    fn non_fee_transfers_become_updates() {
        let mut builder = RecordBuilder::new(99);
        let op = builder
            .build(&Event::InsertTransfer(transfer_event(101, false)))
            .unwrap();
        match op {
            Some(BuiltOp::Transfer(update)) => {
                assert_eq!(update.old_output, format!("{}:1", txid('e')));
                assert_eq!(update.new_output, format!("{}:0", txid('f')));
                assert_eq!(update.new_location, format!("{}:0:12", txid('f')));
                assert_eq!(update.new_output_value, 9000);
                assert_eq!(update.timestamp_ms, 1_700_000_100_000);
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn sent_as_fee_transfers_are_deferred_not_persisted() {
        let mut builder = RecordBuilder::new(99);
        let op = builder
            .build(&Event::InsertTransfer(transfer_event(101, true)))
            .unwrap();
        assert_eq!(op, None);
    }

    #[test]
    fn resolving_a_deferred_fee_transfer_is_fatal() {
        let mut builder = RecordBuilder::new(99);
        builder
            .build(&Event::InsertTransfer(transfer_event(101, true)))
            .unwrap();
        let result = builder.build(&Event::InsertTransfer(transfer_event(101, false)));
        assert!(matches!(result, Err(IndexerError::InvariantViolation(_))));
        // a second resolution attempt reports the double use
        let result = builder.build(&Event::InsertTransfer(transfer_event(101, false)));
        match result {
            Err(IndexerError::InvariantViolation(reason)) => {
                assert!(reason.contains("already used"), "reason: {reason}")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn fee_transfer_at_a_different_height_does_not_block_later_transfers() {
        let mut builder = RecordBuilder::new(99);
        builder
            .build(&Event::InsertTransfer(transfer_event(101, true)))
            .unwrap();
        let op = builder
            .build(&Event::InsertTransfer(transfer_event(102, false)))
            .unwrap();
        assert!(matches!(op, Some(BuiltOp::Transfer(_))));
    }
}
