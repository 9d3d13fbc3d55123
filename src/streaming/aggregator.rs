//! Per-tool argument buffering.
//!
//! Fragments are forwarded as soon as they are valid UTF-8; the accumulated
//! buffer is parsed as JSON only once the final fragment arrives.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct ArgumentStreamer {
    tool_name: String,
    buffer: String,
    /// Bytes of a code point split across fragments
    pending_tail: Vec<u8>,
    fragments: usize,
    bytes_received: usize,
}

impl ArgumentStreamer {
    fn new(tool_name: &str) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            buffer: String::new(),
            pending_tail: Vec::new(),
            fragments: 0,
            bytes_received: 0,
        }
    }

    /// Append a fragment; returns the text that became complete
    fn push(&mut self, fragment: &[u8]) -> String {
        self.fragments += 1;
        self.bytes_received += fragment.len();

        let mut data = std::mem::take(&mut self.pending_tail);
        data.extend_from_slice(fragment);

        let split = incomplete_tail_start(&data);
        self.pending_tail = data.split_off(split);

        let text = match String::from_utf8(data) {
            Ok(text) => text,
            Err(e) => {
                warn!(tool = %self.tool_name, "Invalid UTF-8 in tool arguments, replacing");
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        self.buffer.push_str(&text);
        text
    }

    /// Flush any held-back bytes; returns what was flushed
    fn flush_tail(&mut self) -> String {
        if self.pending_tail.is_empty() {
            return String::new();
        }
        warn!(
            tool = %self.tool_name,
            bytes = self.pending_tail.len(),
            "Tool arguments ended inside a UTF-8 sequence"
        );
        let tail = String::from_utf8_lossy(&std::mem::take(&mut self.pending_tail)).into_owned();
        self.buffer.push_str(&tail);
        tail
    }
}

/// Result of feeding one fragment
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutcome {
    /// Text ready to forward as an argument delta
    pub emitted: String,
    pub complete: bool,
    /// Full argument text (meaningful once complete)
    pub arguments: String,
    /// Parsed arguments (`{}` until complete, or when parsing fails)
    pub parsed: serde_json::Value,
    pub bytes_received: usize,
}

#[derive(Debug, Default)]
pub struct ArgumentAggregator {
    streamers: HashMap<String, ArgumentStreamer>,
}

impl ArgumentAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a fragment for `tool_use_id`, creating its buffer on first use
    pub fn process(
        &mut self,
        tool_use_id: &str,
        tool_name: &str,
        fragment: &[u8],
        is_final: bool,
    ) -> AggregateOutcome {
        let streamer = self
            .streamers
            .entry(tool_use_id.to_string())
            .or_insert_with(|| {
                debug!(tool_use_id, tool = tool_name, "Started argument stream");
                ArgumentStreamer::new(tool_name)
            });

        let mut emitted = streamer.push(fragment);

        if !is_final {
            return AggregateOutcome {
                emitted,
                complete: false,
                arguments: streamer.buffer.clone(),
                parsed: serde_json::json!({}),
                bytes_received: streamer.bytes_received,
            };
        }

        emitted.push_str(&streamer.flush_tail());

        let Some(streamer) = self.streamers.remove(tool_use_id) else {
            return AggregateOutcome {
                emitted,
                complete: true,
                arguments: String::new(),
                parsed: serde_json::json!({}),
                bytes_received: fragment.len(),
            };
        };

        let parsed = parse_arguments(tool_use_id, &streamer);
        debug!(
            tool_use_id,
            tool = %streamer.tool_name,
            fragments = streamer.fragments,
            bytes = streamer.bytes_received,
            "Argument stream complete"
        );

        AggregateOutcome {
            emitted,
            complete: true,
            arguments: streamer.buffer,
            parsed,
            bytes_received: streamer.bytes_received,
        }
    }

    /// Complete every open buffer, e.g. when the upstream ends early
    pub fn finalize_pending(&mut self) -> Vec<(String, AggregateOutcome)> {
        let mut ids: Vec<String> = self.streamers.keys().cloned().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| {
                let name = self.streamers.get(&id)?.tool_name.clone();
                let outcome = self.process(&id, &name, &[], true);
                Some((id, outcome))
            })
            .collect()
    }

    /// Drop a buffer without parsing it; true if one existed
    pub fn discard(&mut self, tool_use_id: &str) -> bool {
        match self.streamers.remove(tool_use_id) {
            Some(streamer) => {
                debug!(
                    tool_use_id,
                    tool = %streamer.tool_name,
                    bytes = streamer.bytes_received,
                    "Discarded partial tool arguments"
                );
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.streamers.len()
    }

    pub fn is_streaming(&self, tool_use_id: &str) -> bool {
        self.streamers.contains_key(tool_use_id)
    }
}

fn parse_arguments(tool_use_id: &str, streamer: &ArgumentStreamer) -> serde_json::Value {
    let trimmed = streamer.buffer.trim();
    match trimmed {
        "{}" => return serde_json::json!({}),
        "[]" => return serde_json::json!([]),
        _ => {}
    }

    match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(e) if trimmed.is_empty() => {
            info!(
                tool_use_id,
                tool = %streamer.tool_name,
                error = %e,
                "Tool produced no arguments, using empty object"
            );
            serde_json::json!({})
        }
        Err(e) => {
            error!(
                tool_use_id,
                tool = %streamer.tool_name,
                error = %e,
                arguments = %streamer.buffer,
                "Failed to parse tool arguments, using empty object"
            );
            serde_json::json!({})
        }
    }
}

/// Index where a trailing, not yet complete UTF-8 sequence begins
fn incomplete_tail_start(data: &[u8]) -> usize {
    let len = data.len();
    // A code point is at most 4 bytes; look back over at most 3 continuation bytes
    for back in 1..=len.min(4) {
        let byte = data[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return len,
        };
        return if back < needed { len - back } else { len };
    }
    len
}
