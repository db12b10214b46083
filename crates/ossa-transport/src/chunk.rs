//! Chunked delivery of oversized envelopes.
//!
//! An envelope whose JSON text exceeds the carrier's frame limit is split on
//! UTF-8 boundaries into string parts. Each part travels as the payload of a
//! `message` envelope with `metadata.chunked` set; the receiver concatenates
//! the parts in index order and parses the original envelope back.

use crate::envelope::{ChunkInfo, EnvelopeMetadata, MessageType, TransportMessage};
use crate::error::TransportError;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest JSON string encoding of a single char (`\u001f`).
const MAX_ESCAPED_CHAR_LEN: usize = 6;

/// Smallest part a frame must be able to carry after the chunk overhead.
const MIN_PART_BYTES: usize = 256;

/// How many completed message ids are remembered to drop late duplicates.
const COMPLETED_CAPACITY: usize = 1024;

/// Length of `c` once escaped inside a JSON string.
fn escaped_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\u{08}' | '\u{0C}' | '\n' | '\r' | '\t' => 2,
        c if (c as u32) < 0x20 => MAX_ESCAPED_CHAR_LEN,
        c => c.len_utf8(),
    }
}

/// Split `text` into parts whose JSON string encoding is at most `budget`
/// bytes. Parts always end on a char boundary.
pub fn split_utf8(text: &str, budget: usize) -> Vec<&str> {
    let budget = budget.max(MAX_ESCAPED_CHAR_LEN);
    let mut parts = Vec::new();
    let mut start = 0;
    let mut used = 0;

    for (i, c) in text.char_indices() {
        let len = escaped_len(c);
        if used + len > budget && i > start {
            parts.push(&text[start..i]);
            start = i;
            used = 0;
        }
        used += len;
    }
    if start < text.len() || parts.is_empty() {
        parts.push(&text[start..]);
    }
    parts
}

/// Serialize an envelope into one or more frames of at most
/// `max_frame_bytes` each.
///
/// Fails with `FrameLimit` when the envelope needs chunking but a frame
/// cannot hold the chunk overhead plus a minimal part.
pub fn chunk_envelope(
    envelope: &TransportMessage,
    max_frame_bytes: usize,
) -> Result<Vec<String>, TransportError> {
    let text = serde_json::to_string(envelope)?;
    if text.len() <= max_frame_bytes {
        return Ok(vec![text]);
    }

    let overhead = serde_json::to_string(&chunk_frame(envelope, "", u32::MAX, u32::MAX))?.len();
    let required = overhead + MIN_PART_BYTES;
    if max_frame_bytes < required {
        return Err(TransportError::FrameLimit {
            limit: max_frame_bytes,
            required,
        });
    }
    let budget = max_frame_bytes - overhead;
    let parts = split_utf8(&text, budget);
    let total = parts.len() as u32;

    debug!(
        message_id = %envelope.id,
        bytes = text.len(),
        chunks = total,
        "Chunking oversized envelope"
    );

    parts
        .iter()
        .enumerate()
        .map(|(index, part)| {
            serde_json::to_string(&chunk_frame(envelope, part, index as u32, total))
                .map_err(TransportError::from)
        })
        .collect()
}

fn chunk_frame(original: &TransportMessage, part: &str, index: u32, total: u32) -> TransportMessage {
    TransportMessage {
        kind: MessageType::Message,
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: original.timestamp,
        payload: Value::String(part.to_string()),
        metadata: EnvelopeMetadata {
            agent_id: original.metadata.agent_id.clone(),
            correlation_id: original.metadata.correlation_id.clone(),
            chunked: Some(ChunkInfo {
                chunk_index: index,
                total_chunks: total,
                message_id: original.id.clone(),
            }),
            ..Default::default()
        },
    }
}

#[derive(Debug)]
struct ChunkBuffer {
    total: u32,
    parts: BTreeMap<u32, String>,
    created_at: Instant,
}

/// Per-message reassembly buffers.
#[derive(Debug)]
pub struct ChunkAssembler {
    buffers: HashMap<String, ChunkBuffer>,
    completed: VecDeque<String>,
    completed_ids: HashSet<String>,
    max_age: Duration,
}

impl ChunkAssembler {
    /// Incomplete buffers older than `max_age` are discarded.
    pub fn new(max_age: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            completed: VecDeque::new(),
            completed_ids: HashSet::new(),
            max_age,
        }
    }

    /// Add one part. Returns the concatenated text once every index of the
    /// message is present; later parts for that message are ignored.
    pub fn push(&mut self, info: &ChunkInfo, part: String, now: Instant) -> Option<String> {
        self.prune(now);

        if self.completed_ids.contains(&info.message_id) {
            debug!(message_id = %info.message_id, index = info.chunk_index, "Ignoring chunk of completed message");
            return None;
        }
        if info.total_chunks == 0 || info.chunk_index >= info.total_chunks {
            debug!(
                message_id = %info.message_id,
                index = info.chunk_index,
                total = info.total_chunks,
                "Ignoring chunk with invalid index"
            );
            return None;
        }

        let buffer = self
            .buffers
            .entry(info.message_id.clone())
            .or_insert_with(|| ChunkBuffer {
                total: info.total_chunks,
                parts: BTreeMap::new(),
                created_at: now,
            });
        if buffer.total != info.total_chunks {
            debug!(message_id = %info.message_id, "Ignoring chunk with mismatched total");
            return None;
        }
        buffer.parts.entry(info.chunk_index).or_insert(part);
        if buffer.parts.len() < buffer.total as usize {
            return None;
        }

        let buffer = self.buffers.remove(&info.message_id)?;
        self.remember(info.message_id.clone());
        Some(buffer.parts.into_values().collect())
    }

    /// Drop incomplete buffers older than the max age. Returns how many.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.buffers.len();
        let max_age = self.max_age;
        self.buffers.retain(|message_id, buffer| {
            let keep = now.saturating_duration_since(buffer.created_at) <= max_age;
            if !keep {
                debug!(
                    %message_id,
                    received = buffer.parts.len(),
                    total = buffer.total,
                    "Discarding stale chunk buffer"
                );
            }
            keep
        });
        before - self.buffers.len()
    }

    /// Number of incomplete messages.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    fn remember(&mut self, message_id: String) {
        if self.completed.len() == COMPLETED_CAPACITY {
            if let Some(oldest) = self.completed.pop_front() {
                self.completed_ids.remove(&oldest);
            }
        }
        self.completed_ids.insert(message_id.clone());
        self.completed.push_back(message_id);
    }
}
