use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::ord::inscription_id::InscriptionId;
use crate::ord::sat_point::SatPoint;

/// Multi-character field separator of the primary event log. Free-text tail
/// fields may contain it, hence the join-back handling below.
pub const FIELD_MARKER: &str = "~||~";
/// Field separator of the secondary block-index log.
pub const BLOCK_INDEX_MARKER: char = ';';
/// Constant command tag opening every record on both logs.
pub const COMMAND_TAG: &str = "cmd";

// A content line carries 9 structural head fields, the opaque content
// payload, then 11 structural tail fields.
const CONTENT_LINE_FIELDS: usize = 21;
const CONTENT_HEAD_FIELDS: usize = 9;
const CONTENT_TAIL_FIELDS: usize = 11;

const TRANSFER_LINE_FIELDS: usize = 12;
const NUMBER_TO_ID_LINE_FIELDS: usize = 8;

lazy_static! {
    static ref SAT_RE: Regex = Regex::new(r"^(?:Some\()?Sat\((\d+)\)\)?$").unwrap();
    static ref LOCATION_RE: Regex = Regex::new(
        r"txid:\s*0x([0-9a-fA-F]{64}),\s*vout:\s*(\d+)\s*\},\s*offset:\s*(\d+)"
    )
    .unwrap();
    static ref DELEGATE_RE: Regex =
        Regex::new(r"txid:\s*0x([0-9a-fA-F]{64}),\s*index:\s*(\d+)").unwrap();
    static ref METADATA_RE: Regex =
        Regex::new(r#"Text\("([^"]+)"\),\s*Integer\(Integer\((\d+)\)\)"#).unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unable to decode log line: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    fn new(reason: impl Into<String>) -> DecodeError {
        DecodeError {
            reason: reason.into(),
        }
    }
}

/// One decoded line of the primary event log. Ordering within the stream is
/// significant; events are immutable once decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BlockStart { height: u64 },
    BlockEnd { height: u64 },
    InsertNumberToId(NumberToIdEvent),
    InsertTransfer(TransferEvent),
    InsertContent(ContentEvent),
}

impl Event {
    pub fn height(&self) -> u64 {
        match self {
            Event::BlockStart { height } | Event::BlockEnd { height } => *height,
            Event::InsertNumberToId(event) => event.height,
            Event::InsertTransfer(event) => event.height,
            Event::InsertContent(event) => event.height,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberToIdEvent {
    pub height: u64,
    pub number: i64,
    pub inscription_id: String,
    pub cursed: bool,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub height: u64,
    pub inscription_id: String,
    pub old_satpoint: Option<SatPoint>,
    pub new_satpoint: SatPoint,
    pub sent_as_fee: bool,
    pub new_pkscript: String,
    pub new_address: Option<String>,
    pub new_output_value: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentEvent {
    pub height: u64,
    pub number: i64,
    pub inscription_id: String,
    pub is_json: bool,
    pub content_type: Option<String>,
    pub metaprotocol: Option<String>,
    pub content: Option<String>,
    pub parents: Option<String>,
    pub sat: Option<u64>,
    pub timestamp: i64,
    pub location: Option<SatPoint>,
    pub charms: u16,
    pub output_value: Option<u64>,
    pub address: Option<String>,
    pub delegate: Option<String>,
    pub sha: Option<String>,
    pub metadata: Option<BTreeMap<String, JsonValue>>,
}

/// One `height;hash` declaration from the secondary block-index log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub height: u64,
    pub hash: String,
}

/// Decodes one line of the primary event log. Returns `Ok(None)` for blank
/// lines and lines not opened by the command tag; anything else either
/// produces exactly one event or a typed decode error.
pub fn decode_event_line(line: &str) -> Result<Option<Event>, DecodeError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let parts: Vec<&str> = line.split(FIELD_MARKER).collect();
    if parts[0] != COMMAND_TAG {
        return Ok(None);
    }
    if parts.len() < 3 {
        return Err(DecodeError::new(format!(
            "expected at least 3 fields, got {}",
            parts.len()
        )));
    }

    let height = tagged_u64(parts[1], "height")?;

    match parts[2] {
        "block_start" => Ok(Some(Event::BlockStart { height })),
        "block_end" => Ok(Some(Event::BlockEnd { height })),
        "insert" => decode_insert(height, &parts).map(Some),
        kind => Err(DecodeError::new(format!("unknown event kind `{kind}`"))),
    }
}

/// Decodes one line of the secondary block-index log, `Ok(None)` for blank
/// or foreign lines.
pub fn decode_block_index_line(line: &str) -> Result<Option<BlockIndexEntry>, DecodeError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let parts: Vec<&str> = line.split(BLOCK_INDEX_MARKER).collect();
    if parts[0] != COMMAND_TAG {
        return Ok(None);
    }
    if parts.len() < 4 || parts[2].trim() != "new_block" {
        return Ok(None);
    }
    let height = parts[1]
        .trim()
        .parse::<u64>()
        .map_err(|e| DecodeError::new(format!("block index height not an integer: {e}")))?;
    let hash = parts[3].trim();
    if hash.is_empty() {
        return Err(DecodeError::new("block index entry missing hash"));
    }
    Ok(Some(BlockIndexEntry {
        height,
        hash: hash.to_string(),
    }))
}

fn decode_insert(height: u64, parts: &[&str]) -> Result<Event, DecodeError> {
    if parts.len() < 4 {
        return Err(DecodeError::new("insert line missing table field"));
    }
    match parts[3] {
        "number_to_id" => decode_number_to_id(height, parts),
        "transfer" => decode_transfer(height, parts),
        "content" => decode_content(height, parts),
        table => Err(DecodeError::new(format!("unknown insert table `{table}`"))),
    }
}

fn decode_number_to_id(height: u64, parts: &[&str]) -> Result<Event, DecodeError> {
    if parts.len() != NUMBER_TO_ID_LINE_FIELDS {
        return Err(DecodeError::new(format!(
            "number_to_id line has {} fields, expected {}",
            parts.len(),
            NUMBER_TO_ID_LINE_FIELDS
        )));
    }
    Ok(Event::InsertNumberToId(NumberToIdEvent {
        height,
        number: tagged_i64(parts[4], "number")?,
        inscription_id: tagged_inscription_id(parts[5])?,
        cursed: tagged_bool(parts[6], "cursed")?,
        parent: optional(tagged_value(parts[7], "parent")?),
    }))
}

fn decode_transfer(height: u64, parts: &[&str]) -> Result<Event, DecodeError> {
    if parts.len() != TRANSFER_LINE_FIELDS {
        return Err(DecodeError::new(format!(
            "transfer line has {} fields, expected {}",
            parts.len(),
            TRANSFER_LINE_FIELDS
        )));
    }
    let old_satpoint = match optional(tagged_value(parts[5], "old_satpoint")?) {
        Some(raw) => Some(raw.parse::<SatPoint>().map_err(DecodeError::new)?),
        None => None,
    };
    let new_satpoint = tagged_value(parts[6], "new_satpoint")?
        .parse::<SatPoint>()
        .map_err(DecodeError::new)?;
    Ok(Event::InsertTransfer(TransferEvent {
        height,
        inscription_id: tagged_inscription_id(parts[4])?,
        old_satpoint,
        new_satpoint,
        sent_as_fee: tagged_bool(parts[7], "sent_as_fee")?,
        new_pkscript: tagged_value(parts[8], "new_pkscript")?.to_string(),
        new_address: quoted(tagged_value(parts[10], "new_address")?),
        new_output_value: tagged_u64(parts[9], "new_output_value")?,
        timestamp: tagged_i64(parts[11], "timestamp")?,
    }))
}

fn decode_content(height: u64, parts: &[&str]) -> Result<Event, DecodeError> {
    if parts.len() < CONTENT_LINE_FIELDS {
        return Err(DecodeError::new(format!(
            "content line has {} fields, expected at least {}",
            parts.len(),
            CONTENT_LINE_FIELDS
        )));
    }

    // The content payload may contain the field marker itself: everything
    // between the structural head and tail is rejoined verbatim.
    let payload = parts[CONTENT_HEAD_FIELDS..parts.len() - CONTENT_TAIL_FIELDS]
        .join(FIELD_MARKER);
    let tail = &parts[parts.len() - CONTENT_TAIL_FIELDS..];

    let content = decode_content_payload(&payload)?;
    let metadata = optional_wrapped(tagged_value(tail[10], "metadata")?)
        .and_then(|literal| decode_metadata_literal(literal));

    Ok(Event::InsertContent(ContentEvent {
        height,
        number: tagged_i64(parts[4], "number")?,
        inscription_id: tagged_inscription_id(parts[5])?,
        is_json: tagged_bool(parts[6], "is_json")?,
        content_type: optional(tagged_value(parts[7], "content_type")?),
        metaprotocol: optional(tagged_value(parts[8], "metaprotocol")?),
        content,
        parents: optional(tagged_value(tail[0], "parents")?),
        sat: decode_sat(tagged_value(tail[1], "sat")?),
        timestamp: tagged_i64(tail[2], "timestamp")?,
        location: decode_location(tagged_value(tail[3], "location")?),
        charms: tagged_u64(tail[4], "charms")? as u16,
        output_value: optional(tagged_value(tail[5], "output_value")?)
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|e| DecodeError::new(format!("output_value not an integer: {e}")))
            })
            .transpose()?,
        address: quoted(tagged_value(tail[6], "address")?),
        delegate: decode_delegate(tagged_value(tail[7], "delegate")?),
        sha: optional_wrapped(tagged_value(tail[8], "sha")?).map(|sha| sha.to_string()),
        metadata,
    }))
}

fn decode_content_payload(payload: &str) -> Result<Option<String>, DecodeError> {
    let raw = if let Some(rest) = payload.strip_prefix("content_json:") {
        rest
    } else if let Some(rest) = payload.strip_prefix("content:") {
        rest
    } else {
        return Err(DecodeError::new(format!(
            "content payload missing `content:` tag: {}",
            excerpt(payload)
        )));
    };
    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(raw.to_string()))
}

/// Parses the tagged satoshi sub-field. Absence decodes as `None`; the
/// record builder treats a missing sat as fatal, not the decoder.
fn decode_sat(value: &str) -> Option<u64> {
    SAT_RE
        .captures(value)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
}

fn decode_location(value: &str) -> Option<SatPoint> {
    let captures = LOCATION_RE.captures(value)?;
    Some(SatPoint {
        txid: captures.get(1)?.as_str().to_lowercase(),
        vout: captures.get(2)?.as_str().parse().ok()?,
        offset: captures.get(3)?.as_str().parse().ok()?,
    })
}

fn decode_delegate(value: &str) -> Option<String> {
    let captures = DELEGATE_RE.captures(value)?;
    let txid = captures.get(1)?.as_str().to_lowercase();
    let index = captures.get(2)?.as_str();
    Some(format!("{txid}i{index}"))
}

/// Parses the single `Text("key"), Integer(Integer(n))` metadata pair form.
/// Any other shape yields absent metadata, a documented limitation.
fn decode_metadata_literal(literal: &str) -> Option<BTreeMap<String, JsonValue>> {
    let captures = METADATA_RE.captures(literal)?;
    let key = captures.get(1)?.as_str().to_string();
    let value = captures.get(2)?.as_str().parse::<i64>().ok()?;
    let mut metadata = BTreeMap::new();
    metadata.insert(key, JsonValue::from(value));
    Some(metadata)
}

fn tagged_inscription_id(field: &str) -> Result<String, DecodeError> {
    let raw = tagged_value(field, "id")?;
    let id = raw
        .parse::<InscriptionId>()
        .map_err(|e| DecodeError::new(format!("invalid inscription id `{}`: {e}", excerpt(raw))))?;
    Ok(id.to_string())
}

fn tagged_value<'a>(field: &'a str, tag: &str) -> Result<&'a str, DecodeError> {
    match field.split_once(':') {
        Some((found, rest)) if found == tag => Ok(rest),
        _ => Err(DecodeError::new(format!(
            "expected `{tag}:` field, got `{}`",
            excerpt(field)
        ))),
    }
}

fn tagged_u64(field: &str, tag: &str) -> Result<u64, DecodeError> {
    tagged_value(field, tag)?
        .trim()
        .parse::<u64>()
        .map_err(|e| DecodeError::new(format!("`{tag}` not an integer: {e}")))
}

fn tagged_i64(field: &str, tag: &str) -> Result<i64, DecodeError> {
    tagged_value(field, tag)?
        .trim()
        .parse::<i64>()
        .map_err(|e| DecodeError::new(format!("`{tag}` not an integer: {e}")))
}

fn tagged_bool(field: &str, tag: &str) -> Result<bool, DecodeError> {
    match tagged_value(field, tag)?.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(DecodeError::new(format!(
            "`{tag}` not a boolean: `{other}`"
        ))),
    }
}

fn optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "None" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `Some(x)` → `x`, bare values pass through, `None`/empty → absent.
fn optional_wrapped(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "None" {
        return None;
    }
    match trimmed
        .strip_prefix("Some(")
        .and_then(|v| v.strip_suffix(')'))
    {
        Some(inner) => Some(inner),
        None => Some(trimmed),
    }
}

fn quoted(value: &str) -> Option<String> {
    let start = value.find('"')? + 1;
    let end = value[start..].find('"')? + start;
    if start == end {
        return None;
    }
    Some(value[start..end].to_string())
}

fn excerpt(value: &str) -> String {
    value.chars().take(48).collect()
}
