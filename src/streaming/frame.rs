//! Binary frame decoder for the upstream event stream.
//!
//! Wire layout (big-endian):
//!
//! ```text
//! total_len:u32 | headers_len:u32 | prelude_crc:u32 | headers | payload | message_crc:u32
//! ```
//!
//! The decoder accepts arbitrarily sized chunks. Header bytes are handed to the
//! resumable [`HeaderParser`] as soon as they arrive; the payload is buffered
//! until complete.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use super::headers::{
    CONTENT_TYPE, ERROR_CODE, EVENT_TYPE, EXCEPTION_TYPE, HeaderParser, HeaderValue, Headers,
    MAX_HEADER_NAME_LEN, MESSAGE_TYPE,
};
use crate::config::StreamConfig;

pub const PRELUDE_LEN: usize = 12;
pub const MESSAGE_CRC_LEN: usize = 4;
pub const MIN_MESSAGE_LEN: usize = PRELUDE_LEN + MESSAGE_CRC_LEN;

/// One decoded upstream message
#[derive(Debug, Clone, PartialEq)]
pub struct FramedMessage {
    pub headers: Headers,
    pub payload: Bytes,
}

impl FramedMessage {
    /// `:message-type`, defaulting to `event`
    pub fn message_type(&self) -> &str {
        self.headers.get_str(MESSAGE_TYPE).unwrap_or("event")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.headers.get_str(EVENT_TYPE)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get_str(CONTENT_TYPE)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub max_message_bytes: usize,
    pub verify_crc: bool,
    /// Consecutive empty `feed(&[])` calls tolerated mid-header before the
    /// header block is force-completed. Only empty feeds advance the count
    /// and any feed carrying header bytes resets it, so a body that never
    /// yields empty chunks never triggers forced completion.
    pub header_stall_threshold: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for DecoderConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            max_message_bytes: config.max_message_bytes,
            verify_crc: config.verify_crc,
            header_stall_threshold: config.header_stall_threshold,
        }
    }
}

#[derive(Debug)]
enum DecodePhase {
    Prelude,
    Headers {
        remaining: usize,
        payload_len: usize,
        /// Header parser gave up; remaining header bytes are discarded
        forced: Option<Headers>,
    },
    Payload {
        payload_len: usize,
        headers: Headers,
    },
}

/// Counters describing decoder activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub messages: usize,
    pub bytes_consumed: usize,
    pub framing_errors: usize,
    pub crc_mismatches: usize,
    pub forced_headers: usize,
}

/// Stateful decoder turning raw chunks into framed messages
pub struct EventStreamDecoder {
    buffer: BytesMut,
    phase: DecodePhase,
    header_parser: HeaderParser,
    crc: crc32fast::Hasher,
    config: DecoderConfig,
    stats: DecoderStats,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::with_config(DecoderConfig::default())
    }

    pub fn with_config(config: DecoderConfig) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            phase: DecodePhase::Prelude,
            header_parser: HeaderParser::new(config.header_stall_threshold),
            crc: crc32fast::Hasher::new(),
            config,
            stats: DecoderStats::default(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Bytes received but not yet part of an emitted message
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the decoder sits between messages with nothing pending
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, DecodePhase::Prelude) && self.buffer.is_empty()
    }

    /// Feed new data and extract complete messages
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<FramedMessage> {
        self.buffer.extend_from_slice(chunk);

        if chunk.is_empty() {
            self.note_empty_feed();
        }

        let mut messages = Vec::new();
        loop {
            match &mut self.phase {
                DecodePhase::Prelude => {
                    if !self.read_prelude() {
                        break;
                    }
                }
                DecodePhase::Headers {
                    remaining,
                    payload_len,
                    forced,
                } => {
                    if *remaining > 0 {
                        let take = (*remaining).min(self.buffer.len());
                        if take == 0 {
                            break;
                        }
                        let bytes = self.buffer.split_to(take);
                        self.crc.update(&bytes);
                        self.stats.bytes_consumed += take;
                        if forced.is_none() {
                            self.header_parser.feed(&bytes);
                        }
                        *remaining -= take;
                        if *remaining > 0 {
                            break;
                        }
                    }

                    let payload_len = *payload_len;
                    let headers = match forced.take() {
                        Some(headers) => headers,
                        None => self.header_parser.finish(),
                    };
                    self.phase = DecodePhase::Payload {
                        payload_len,
                        headers,
                    };
                }
                DecodePhase::Payload { payload_len, .. } => {
                    if self.buffer.len() < *payload_len + MESSAGE_CRC_LEN {
                        break;
                    }
                    if let DecodePhase::Payload {
                        payload_len,
                        headers,
                    } = std::mem::replace(&mut self.phase, DecodePhase::Prelude)
                    {
                        messages.push(self.read_payload(payload_len, headers));
                    }
                }
            }
        }

        messages
    }

    /// Clear all state (connection reuse)
    pub fn reset(&mut self) {
        self.buffer.clear();
        if self.buffer.capacity() > 65536 {
            self.buffer = BytesMut::with_capacity(8192);
        }
        self.phase = DecodePhase::Prelude;
        self.header_parser.reset();
        self.crc = crc32fast::Hasher::new();
    }

    fn note_empty_feed(&mut self) {
        if let DecodePhase::Headers {
            remaining, forced, ..
        } = &mut self.phase
            && *remaining > 0
            && forced.is_none()
        {
            self.header_parser.note_stall();
            if self.header_parser.is_stalled() {
                self.stats.forced_headers += 1;
                *forced = Some(self.header_parser.force_complete());
            }
        }
    }

    /// Returns false when more bytes are needed
    fn read_prelude(&mut self) -> bool {
        loop {
            if self.buffer.len() < PRELUDE_LEN {
                return false;
            }

            let total_len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            let headers_len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;
            let prelude_crc = u32::from_be_bytes([
                self.buffer[8],
                self.buffer[9],
                self.buffer[10],
                self.buffer[11],
            ]);

            if total_len < MIN_MESSAGE_LEN
                || total_len > self.config.max_message_bytes
                || headers_len > total_len - MIN_MESSAGE_LEN
            {
                warn!(total_len, headers_len, "Invalid frame prelude, resyncing");
                self.skip_byte();
                continue;
            }

            if self.config.verify_crc && crc32fast::hash(&self.buffer[..8]) != prelude_crc {
                warn!(total_len, headers_len, "Prelude CRC mismatch, resyncing");
                self.stats.crc_mismatches += 1;
                self.skip_byte();
                continue;
            }

            self.crc = crc32fast::Hasher::new();
            self.crc.update(&self.buffer[..PRELUDE_LEN]);
            self.buffer.advance(PRELUDE_LEN);
            self.stats.bytes_consumed += PRELUDE_LEN;
            self.header_parser.reset();

            debug!(total_len, headers_len, "Decoded frame prelude");
            self.phase = DecodePhase::Headers {
                remaining: headers_len,
                payload_len: total_len - headers_len - MIN_MESSAGE_LEN,
                forced: None,
            };
            return true;
        }
    }

    fn read_payload(&mut self, payload_len: usize, headers: Headers) -> FramedMessage {
        let payload = self.buffer.split_to(payload_len).freeze();
        self.crc.update(&payload);
        let expected = self.buffer.get_u32();
        let actual = std::mem::take(&mut self.crc).finalize();

        if self.config.verify_crc && actual != expected {
            self.stats.crc_mismatches += 1;
            warn!(
                expected,
                actual,
                event_type = headers.get_str(EVENT_TYPE).unwrap_or("unknown"),
                "Message CRC mismatch, delivering anyway"
            );
        }

        self.stats.messages += 1;
        self.stats.bytes_consumed += payload_len + MESSAGE_CRC_LEN;
        FramedMessage { headers, payload }
    }

    fn skip_byte(&mut self) {
        self.buffer.advance(1);
        self.stats.framing_errors += 1;
        self.stats.bytes_consumed += 1;
    }
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a message in the event-stream wire format
pub fn encode_message(headers: &Headers, payload: &[u8]) -> Bytes {
    let mut header_block = BytesMut::new();
    for (name, value) in headers.iter() {
        debug_assert!(name.len() <= MAX_HEADER_NAME_LEN);
        header_block.put_u8(name.len() as u8);
        header_block.put_slice(name.as_bytes());
        value.encode(&mut header_block);
    }

    let total_len = MIN_MESSAGE_LEN + header_block.len() + payload.len();
    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_u32(total_len as u32);
    buf.put_u32(header_block.len() as u32);
    let prelude_crc = crc32fast::hash(&buf[..8]);
    buf.put_u32(prelude_crc);
    buf.put_slice(&header_block);
    buf.put_slice(payload);
    let message_crc = crc32fast::hash(&buf);
    buf.put_u32(message_crc);
    buf.freeze()
}

/// Encode a JSON event message of the given `:event-type`
pub fn encode_event(event_type: &str, payload: &serde_json::Value) -> Bytes {
    let headers = Headers::new()
        .with_str(MESSAGE_TYPE, "event")
        .with_str(EVENT_TYPE, event_type)
        .with_str(CONTENT_TYPE, "application/json");
    encode_message(&headers, payload.to_string().as_bytes())
}

/// Encode an `error` or `exception` message
pub fn encode_error(message_type: &str, code: &str, payload: &serde_json::Value) -> Bytes {
    let code_header = if message_type == "exception" {
        EXCEPTION_TYPE
    } else {
        ERROR_CODE
    };
    let mut headers = Headers::new().with_str(MESSAGE_TYPE, message_type);
    headers.insert(code_header, HeaderValue::String(code.to_string()));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::String("application/json".to_string()),
    );
    encode_message(&headers, payload.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_event(text: &str) -> Bytes {
        encode_event(
            "assistantResponseEvent",
            &json!({"content": text, "stop": false}),
        )
    }

    #[test]
    fn test_decode_single_message() {
        let mut decoder = EventStreamDecoder::new();
        let messages = decoder.feed(&text_event("hello"));

        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.message_type(), "event");
        assert_eq!(msg.event_type(), Some("assistantResponseEvent"));
        assert_eq!(msg.content_type(), Some("application/json"));
        assert_eq!(&msg.payload[..], br#"{"content":"hello","stop":false}"#);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_decode_byte_at_a_time_matches_whole() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&text_event("héllo wörld"));
        stream.extend_from_slice(&encode_event(
            "toolUseEvent",
            &json!({"toolUseId": "t1", "name": "Glob", "input": "{\"pa", "stop": false}),
        ));

        let whole = EventStreamDecoder::new().feed(&stream);

        let mut decoder = EventStreamDecoder::new();
        let mut pieces = Vec::new();
        for byte in stream.iter() {
            pieces.extend(decoder.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(whole.len(), 2);
        assert_eq!(whole, pieces);
    }

    #[test]
    fn test_decode_uneven_chunks() {
        let mut stream = BytesMut::new();
        for i in 0..5 {
            stream.extend_from_slice(&text_event(&format!("part {}", i)));
        }
        let whole = EventStreamDecoder::new().feed(&stream);

        for size in [2, 3, 7, 13, 64] {
            let mut decoder = EventStreamDecoder::new();
            let mut messages = Vec::new();
            for chunk in stream.chunks(size) {
                messages.extend(decoder.feed(chunk));
            }
            assert_eq!(messages, whole, "chunk size {}", size);
        }
    }

    #[test]
    fn test_incomplete_message_waits() {
        let frame = text_event("pending");
        let mut decoder = EventStreamDecoder::new();

        assert!(decoder.feed(&frame[..frame.len() - 1]).is_empty());
        assert!(!decoder.is_idle());
        let messages = decoder.feed(&frame[frame.len() - 1..]);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 1, 9, 9, 9, 9]);
        stream.extend_from_slice(&text_event("after garbage"));

        let mut decoder = EventStreamDecoder::new();
        let messages = decoder.feed(&stream);

        assert_eq!(messages.len(), 1);
        assert_eq!(
            &messages[0].payload[..],
            br#"{"content":"after garbage","stop":false}"#
        );
        assert!(decoder.stats().framing_errors > 0);
    }

    #[test]
    fn test_message_crc_mismatch_still_delivered() {
        let mut frame = BytesMut::from(&text_event("tampered")[..]);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let mut decoder = EventStreamDecoder::new();
        let messages = decoder.feed(&frame);
        assert_eq!(messages.len(), 1);
        assert_eq!(decoder.stats().crc_mismatches, 1);
    }

    #[test]
    fn test_oversized_prelude_rejected() {
        let config = DecoderConfig {
            max_message_bytes: 64,
            verify_crc: true,
            header_stall_threshold: 8,
        };
        let mut decoder = EventStreamDecoder::with_config(config);
        let messages = decoder.feed(&text_event(&"x".repeat(200)));
        assert!(messages.is_empty());
        assert!(decoder.stats().framing_errors > 0);
    }

    #[test]
    fn test_stalled_headers_are_forced() {
        let frame = text_event("stalled");
        let config = DecoderConfig {
            max_message_bytes: 1024,
            verify_crc: true,
            header_stall_threshold: 2,
        };
        let mut decoder = EventStreamDecoder::with_config(config);

        // prelude plus a few header bytes, then nothing arrives for a while
        assert!(decoder.feed(&frame[..PRELUDE_LEN + 4]).is_empty());
        decoder.feed(&[]);
        decoder.feed(&[]);
        assert_eq!(decoder.stats().forced_headers, 1);

        let messages = decoder.feed(&frame[PRELUDE_LEN + 4..]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type(), "event");
        assert_eq!(messages[0].content_type(), Some("application/json"));
        assert_eq!(messages[0].event_type(), None);
    }

    #[test]
    fn test_header_bytes_between_empty_feeds_reset_stall() {
        let frame = text_event("trickle");
        let config = DecoderConfig {
            max_message_bytes: 1024,
            verify_crc: true,
            header_stall_threshold: 2,
        };
        let mut decoder = EventStreamDecoder::with_config(config);

        let mut messages = decoder.feed(&frame[..PRELUDE_LEN]);
        for byte in frame[PRELUDE_LEN..].chunks(1) {
            decoder.feed(&[]);
            messages.extend(decoder.feed(byte));
        }
        assert_eq!(decoder.stats().forced_headers, 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event_type(), Some("assistantResponseEvent"));
    }

    #[test]
    fn test_error_message_headers() {
        let frame = encode_error(
            "exception",
            "ContentLengthExceededException",
            &json!({"message": "too long"}),
        );
        let messages = EventStreamDecoder::new().feed(&frame);
        assert_eq!(messages[0].message_type(), "exception");
        assert_eq!(
            messages[0].headers.get_str(EXCEPTION_TYPE),
            Some("ContentLengthExceededException")
        );
    }

    #[test]
    fn test_reset_clears_pending() {
        let frame = text_event("partial");
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&frame[..20]);
        decoder.reset();
        assert!(decoder.is_idle());
        assert_eq!(decoder.feed(&frame).len(), 1);
    }
}
