use std::collections::BTreeMap;

use crate::core::errors::IndexerError;
use crate::core::protocol::event_decoding::Event;

/// Validated, deduplicated event sequence plus the highest block that was
/// fully closed by a matching `block_end`.
#[derive(Debug, PartialEq)]
pub struct ValidatedStream {
    pub events: Vec<Event>,
    pub max_closed_height: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BoundaryState {
    ExpectingStart,
    InBlock(u64),
}

/// Replays the decoded event stream through the block boundary state
/// machine. A repeated `block_start` at a height already buffered signals
/// the external indexer restarted mid-stream: the superseded segment is
/// discarded by truncating the arena back to its recorded start index.
/// Everything else that breaks the `start(h) .. end(h)` alternation is
/// stream corruption and aborts the cycle without committing.
pub fn validate_block_boundaries(events: Vec<Event>) -> Result<ValidatedStream, IndexerError> {
    let mut arena: Vec<Event> = Vec::with_capacity(events.len());
    let mut state = BoundaryState::ExpectingStart;
    let mut last_start_height: Option<u64> = None;
    // height → index of its block_start in the arena
    let mut segment_starts: BTreeMap<u64, usize> = BTreeMap::new();
    let mut max_closed_height: Option<u64> = None;

    for event in events {
        match event {
            Event::BlockStart { height } => {
                match last_start_height {
                    Some(last) if height <= last => {
                        // Restarted segment: drop every buffered event from
                        // the first superseded block_start onward.
                        let truncate_at = segment_starts
                            .range(height..)
                            .next()
                            .map(|(_, index)| *index)
                            .unwrap_or(0);
                        arena.truncate(truncate_at);
                        segment_starts.retain(|h, _| *h < height);
                        max_closed_height = max_closed_height.filter(|closed| *closed < height);
                    }
                    Some(_) => {
                        if let BoundaryState::InBlock(open) = state {
                            return Err(IndexerError::StreamCorruption(format!(
                                "block_start #{height} while block #{open} is still open (missing block_end)"
                            )));
                        }
                    }
                    None => {
                        if !arena.is_empty() {
                            return Err(IndexerError::StreamCorruption(format!(
                                "faulty block_start position for block #{height}"
                            )));
                        }
                    }
                }
                segment_starts.insert(height, arena.len());
                arena.push(Event::BlockStart { height });
                last_start_height = Some(height);
                state = BoundaryState::InBlock(height);
            }
            Event::BlockEnd { height } => match state {
                BoundaryState::InBlock(open) if open == height => {
                    arena.push(Event::BlockEnd { height });
                    max_closed_height = Some(match max_closed_height {
                        Some(closed) => closed.max(height),
                        None => height,
                    });
                    state = BoundaryState::ExpectingStart;
                }
                BoundaryState::InBlock(open) => {
                    return Err(IndexerError::StreamCorruption(format!(
                        "block_end #{height} does not match open block #{open}"
                    )));
                }
                BoundaryState::ExpectingStart => {
                    return Err(IndexerError::StreamCorruption(format!(
                        "unexpected block_end #{height}"
                    )));
                }
            },
            event => match state {
                BoundaryState::InBlock(_) => arena.push(event),
                BoundaryState::ExpectingStart => {
                    return Err(IndexerError::StreamCorruption(format!(
                        "event at block #{} outside of any open block",
                        event.height()
                    )));
                }
            },
        }
    }

    if let BoundaryState::InBlock(open) = state {
        // The external process terminated mid-block: stop without advancing
        // the log consumption watermark.
        return Err(IndexerError::StreamCorruption(format!(
            "stream ended while block #{open} is still open - did the external indexer crash?"
        )));
    }

    Ok(ValidatedStream {
        events: arena,
        max_closed_height,
    })
}
