//! Classifies framed messages and decodes their payloads into typed events.
//!
//! Payloads are decoded once here; the rest of the pipeline only sees
//! [`UpstreamEvent`] variants.

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::frame::FramedMessage;
use super::headers::{ERROR_CODE, ERROR_MESSAGE, EXCEPTION_TYPE};
use crate::models::claude::StopReason;
use crate::models::upstream::{
    AssistantResponseEvent, CompletionChunkEvent, CompletionEvent, SessionEvent,
    ToolCallErrorEvent, ToolCallRequestEvent, ToolUseEvent, UpstreamErrorPayload,
};

/// Private-use block that carries stray bytes through JSON decoding
const STRAY_BYTE_BASE: u32 = 0xE000;

/// Upstream signal that the response was cut at the context/output limit
const CONTENT_LENGTH_SIGNALS: [&str; 2] =
    ["CONTENT_LENGTH_EXCEEDS_THRESHOLD", "ContentLengthExceeded"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Error,
    Exception,
}

/// Typed event extracted from one framed message
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    TextDelta {
        text: String,
    },
    ToolFragment {
        tool_use_id: String,
        name: String,
        /// Raw argument bytes; may start or end inside a UTF-8 sequence
        fragment: Vec<u8>,
        stop: bool,
    },
    ToolCallRequest {
        tool_use_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallError {
        tool_use_id: String,
        message: String,
    },
    SessionStart {
        session_id: Option<String>,
    },
    SessionEnd {
        session_id: Option<String>,
    },
    /// The upstream declared the turn finished
    Completion {
        stop_reason: Option<StopReason>,
    },
    Error {
        kind: UpstreamErrorKind,
        code: Option<String>,
        message: String,
        payload: serde_json::Value,
    },
}

impl UpstreamEvent {
    /// Whether this is the "content too long" signal
    pub fn is_content_length_exceeded(&self) -> bool {
        match self {
            UpstreamEvent::Error {
                code,
                message,
                payload,
                ..
            } => {
                let reason = payload.get("reason").and_then(|r| r.as_str());
                CONTENT_LENGTH_SIGNALS.iter().any(|signal| {
                    [code.as_deref(), reason, Some(message.as_str())]
                        .into_iter()
                        .flatten()
                        .any(|field| field.contains(signal))
                })
            }
            _ => false,
        }
    }
}

/// Counters describing normalizer activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizerStats {
    pub messages: usize,
    pub events: usize,
    pub unknown: usize,
    pub malformed: usize,
}

#[derive(Debug, Default)]
pub struct EventNormalizer {
    stats: NormalizerStats,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> NormalizerStats {
        self.stats
    }

    /// Convert one framed message into zero or more events
    pub fn normalize(&mut self, message: &FramedMessage) -> Vec<UpstreamEvent> {
        self.stats.messages += 1;

        let events = match message.message_type() {
            "event" => self.normalize_event(message),
            "error" => vec![self.normalize_error(message, UpstreamErrorKind::Error)],
            "exception" => vec![self.normalize_error(message, UpstreamErrorKind::Exception)],
            other => {
                self.stats.unknown += 1;
                warn!(message_type = other, "Unknown message type, ignoring");
                Vec::new()
            }
        };

        self.stats.events += events.len();
        events
    }

    fn normalize_event(&mut self, message: &FramedMessage) -> Vec<UpstreamEvent> {
        let event_type = message.event_type().unwrap_or_default();
        let payload = &message.payload;

        match event_type {
            "assistantResponseEvent" => self.assistant_response(payload),
            "toolUseEvent" => match decode_tool_fragment(payload) {
                Ok(event) => vec![event],
                Err(e) => {
                    self.report_malformed(event_type, payload, &e);
                    Vec::new()
                }
            },
            "completion" => self
                .decode::<CompletionEvent>(event_type, payload)
                .map(|event| {
                    let mut events = text_event(event.content);
                    events.push(UpstreamEvent::Completion {
                        stop_reason: event.finish_reason.as_deref().map(map_finish_reason),
                    });
                    events
                })
                .unwrap_or_default(),
            "completionChunk" => self
                .decode::<CompletionChunkEvent>(event_type, payload)
                .map(|event| {
                    let mut events = text_event(event.delta);
                    if let Some(reason) = event.finish_reason.as_deref() {
                        events.push(UpstreamEvent::Completion {
                            stop_reason: Some(map_finish_reason(reason)),
                        });
                    }
                    events
                })
                .unwrap_or_default(),
            "toolCallRequest" => self
                .decode::<ToolCallRequestEvent>(event_type, payload)
                .map(|event| UpstreamEvent::ToolCallRequest {
                    tool_use_id: event.tool_call_id,
                    name: event.name,
                    arguments: normalize_arguments(event.arguments),
                })
                .into_iter()
                .collect(),
            "toolCallError" => self
                .decode::<ToolCallErrorEvent>(event_type, payload)
                .map(|event| UpstreamEvent::ToolCallError {
                    tool_use_id: event.tool_call_id,
                    message: event.error,
                })
                .into_iter()
                .collect(),
            "sessionStart" => vec![UpstreamEvent::SessionStart {
                session_id: self.session(payload).session_id,
            }],
            "sessionEnd" => {
                let session = self.session(payload);
                debug!(
                    session_id = session.session_id.as_deref().unwrap_or("unknown"),
                    duration = session.duration.unwrap_or_default(),
                    "Upstream session ended"
                );
                vec![UpstreamEvent::SessionEnd {
                    session_id: session.session_id,
                }]
            }
            "meteringEvent" | "contextUsageEvent" => {
                debug!(
                    event_type,
                    payload = %String::from_utf8_lossy(payload),
                    "Usage hint from upstream"
                );
                Vec::new()
            }
            other => {
                self.stats.unknown += 1;
                warn!(event_type = other, "Unknown event type, ignoring");
                Vec::new()
            }
        }
    }

    /// Tool fragments sometimes arrive as assistant responses; the most
    /// specific shape is tried first.
    fn assistant_response(&mut self, payload: &[u8]) -> Vec<UpstreamEvent> {
        if let Ok(tool) = decode_tool_fragment(payload) {
            if let UpstreamEvent::ToolFragment { tool_use_id, .. } = &tool {
                debug!(%tool_use_id, "Assistant response carries a tool fragment");
            }
            return vec![tool];
        }

        let Some(event) = self.decode::<AssistantResponseEvent>("assistantResponseEvent", payload)
        else {
            return Vec::new();
        };

        if event.is_complete() {
            debug!(
                message_id = event.message_id.as_deref().unwrap_or("unknown"),
                "Assistant response complete"
            );
        }
        text_event(event.content)
    }

    fn normalize_error(&mut self, message: &FramedMessage, kind: UpstreamErrorKind) -> UpstreamEvent {
        let payload: serde_json::Value =
            serde_json::from_slice(&message.payload).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
            });
        let body: UpstreamErrorPayload =
            serde_json::from_value(payload.clone()).unwrap_or_default();

        let code = message
            .headers
            .get_str(EXCEPTION_TYPE)
            .or_else(|| message.headers.get_str(ERROR_CODE))
            .map(str::to_string)
            .or(body.reason)
            .or(body.error_type);

        let text = body
            .message
            .or_else(|| message.headers.get_str(ERROR_MESSAGE).map(str::to_string))
            .or_else(|| payload.as_str().map(str::to_string))
            .unwrap_or_else(|| "upstream error".to_string());

        warn!(
            kind = ?kind,
            code = code.as_deref().unwrap_or("none"),
            message = %text,
            "Upstream reported an error"
        );

        UpstreamEvent::Error {
            kind,
            code,
            message: text,
            payload,
        }
    }

    fn decode<T: DeserializeOwned>(&mut self, event_type: &str, payload: &[u8]) -> Option<T> {
        match serde_json::from_slice(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                self.report_malformed(event_type, payload, &e);
                None
            }
        }
    }

    fn report_malformed(&mut self, event_type: &str, payload: &[u8], error: &serde_json::Error) {
        self.stats.malformed += 1;
        warn!(
            event_type,
            error = %error,
            payload = %String::from_utf8_lossy(payload),
            "Failed to decode event payload"
        );
    }

    fn session(&mut self, payload: &[u8]) -> SessionEvent {
        if payload.is_empty() {
            return SessionEvent::default();
        }
        self.decode("session", payload).unwrap_or_default()
    }
}

/// Decode a tool fragment payload.
///
/// The upstream cuts `input` at arbitrary byte offsets, so a payload may hold
/// half of a multi-byte character at either end of that string. Such bytes are
/// smuggled through the JSON decoder as private-use escapes and restored
/// afterwards, leaving the argument aggregator to stitch them together.
fn decode_tool_fragment(payload: &[u8]) -> Result<UpstreamEvent, serde_json::Error> {
    if std::str::from_utf8(payload).is_ok() {
        let event = serde_json::from_slice::<ToolUseEvent>(payload)?;
        return Ok(tool_fragment(event, false));
    }

    let escaped = escape_stray_bytes(payload);
    let event = serde_json::from_slice::<ToolUseEvent>(&escaped)?;
    Ok(tool_fragment(event, true))
}

fn tool_fragment(event: ToolUseEvent, restore_stray: bool) -> UpstreamEvent {
    let fragment = event.fragment();
    UpstreamEvent::ToolFragment {
        fragment: if restore_stray {
            restore_stray_bytes(&fragment)
        } else {
            fragment.into_bytes()
        },
        tool_use_id: event.tool_use_id,
        name: event.name,
        stop: event.stop,
    }
}

/// Replace every byte that is not part of a valid UTF-8 sequence with a
/// `\uE0XX` JSON escape
fn escape_stray_bytes(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 16);
    let mut rest = payload;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.extend_from_slice(valid.as_bytes());
                return out;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                out.extend_from_slice(valid);
                let stray = e.error_len().unwrap_or(after.len());
                for byte in &after[..stray] {
                    let escape = format!("\\u{:04x}", STRAY_BYTE_BASE + u32::from(*byte));
                    out.extend_from_slice(escape.as_bytes());
                }
                rest = &after[stray..];
            }
        }
    }
}

fn restore_stray_bytes(fragment: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(fragment.len());
    let mut buf = [0u8; 4];
    for c in fragment.chars() {
        match u32::from(c).checked_sub(STRAY_BYTE_BASE) {
            Some(offset @ 0x80..=0xFF) => out.push(offset as u8),
            _ => out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes()),
        }
    }
    out
}

fn text_event(text: String) -> Vec<UpstreamEvent> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![UpstreamEvent::TextDelta { text }]
    }
}

/// Arguments sent as a JSON string are parsed; anything else passes through
fn normalize_arguments(arguments: serde_json::Value) -> serde_json::Value {
    match arguments {
        serde_json::Value::String(raw) if raw.trim().is_empty() => serde_json::json!({}),
        serde_json::Value::String(raw) => match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Tool call arguments are not valid JSON, keeping raw string");
                serde_json::Value::String(raw)
            }
        },
        serde_json::Value::Null => serde_json::json!({}),
        other => other,
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "length" | "max_tokens" | "MAX_TOKENS" => StopReason::MaxTokens,
        "tool_use" | "tool_calls" => StopReason::ToolUse,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::frame::{EventStreamDecoder, encode_error, encode_event};
    use serde_json::json;

    fn normalize_one(frame: bytes::Bytes) -> Vec<UpstreamEvent> {
        let messages = EventStreamDecoder::new().feed(&frame);
        assert_eq!(messages.len(), 1);
        EventNormalizer::new().normalize(&messages[0])
    }

    #[test]
    fn test_assistant_text() {
        let events = normalize_one(encode_event(
            "assistantResponseEvent",
            &json!({"content": "hello", "stop": false}),
        ));
        assert_eq!(
            events,
            vec![UpstreamEvent::TextDelta {
                text: "hello".to_string()
            }]
        );
    }

    #[test]
    fn test_assistant_response_with_tool_shape() {
        let events = normalize_one(encode_event(
            "assistantResponseEvent",
            &json!({"toolUseId": "t1", "name": "Glob", "input": "{\"pattern\"", "stop": false}),
        ));
        assert_eq!(
            events,
            vec![UpstreamEvent::ToolFragment {
                tool_use_id: "t1".to_string(),
                name: "Glob".to_string(),
                fragment: b"{\"pattern\"".to_vec(),
                stop: false,
            }]
        );
    }

    #[test]
    fn test_name_field_alone_is_not_a_tool() {
        let events = normalize_one(encode_event(
            "assistantResponseEvent",
            &json!({"content": "I am Ada", "name": "Ada"}),
        ));
        assert_eq!(
            events,
            vec![UpstreamEvent::TextDelta {
                text: "I am Ada".to_string()
            }]
        );
    }

    #[test]
    fn test_complete_assistant_response_without_text() {
        let events = normalize_one(encode_event(
            "assistantResponseEvent",
            &json!({"content": "", "stop": true}),
        ));
        assert!(events.is_empty());
    }

    #[test]
    fn test_tool_call_request_string_arguments() {
        let events = normalize_one(encode_event(
            "toolCallRequest",
            &json!({"toolCallId": "call_1", "name": "get_weather", "arguments": "{\"location\":\"SF\"}"}),
        ));
        assert_eq!(
            events,
            vec![UpstreamEvent::ToolCallRequest {
                tool_use_id: "call_1".to_string(),
                name: "get_weather".to_string(),
                arguments: json!({"location": "SF"}),
            }]
        );
    }

    #[test]
    fn test_completion_emits_text_and_finish() {
        let events = normalize_one(encode_event(
            "completion",
            &json!({"content": "done", "finishReason": "length"}),
        ));
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            UpstreamEvent::Completion {
                stop_reason: Some(StopReason::MaxTokens)
            }
        );
    }

    #[test]
    fn test_completion_chunk_without_finish() {
        let events = normalize_one(encode_event("completionChunk", &json!({"delta": "abc"})));
        assert_eq!(
            events,
            vec![UpstreamEvent::TextDelta {
                text: "abc".to_string()
            }]
        );
    }

    #[test]
    fn test_tool_call_error() {
        let events = normalize_one(encode_event(
            "toolCallError",
            &json!({"toolCallId": "call_1", "error": "boom"}),
        ));
        assert_eq!(
            events,
            vec![UpstreamEvent::ToolCallError {
                tool_use_id: "call_1".to_string(),
                message: "boom".to_string(),
            }]
        );
    }

    #[test]
    fn test_session_events() {
        let start = normalize_one(encode_event("sessionStart", &json!({"sessionId": "s1"})));
        assert_eq!(
            start,
            vec![UpstreamEvent::SessionStart {
                session_id: Some("s1".to_string())
            }]
        );
        let end = normalize_one(encode_event("sessionEnd", &json!({"duration": 12})));
        assert_eq!(end, vec![UpstreamEvent::SessionEnd { session_id: None }]);
    }

    #[test]
    fn test_unknown_event_type_is_ignored() {
        let messages = EventStreamDecoder::new().feed(&encode_event("mystery", &json!({})));
        let mut normalizer = EventNormalizer::new();
        assert!(normalizer.normalize(&messages[0]).is_empty());
        assert_eq!(normalizer.stats().unknown, 1);
    }

    #[test]
    fn test_malformed_payload_is_ignored() {
        let headers = crate::streaming::headers::Headers::new()
            .with_str(crate::streaming::headers::MESSAGE_TYPE, "event")
            .with_str(crate::streaming::headers::EVENT_TYPE, "toolUseEvent");
        let frame = crate::streaming::frame::encode_message(&headers, b"{not json");
        let messages = EventStreamDecoder::new().feed(&frame);
        let mut normalizer = EventNormalizer::new();
        assert!(normalizer.normalize(&messages[0]).is_empty());
        assert_eq!(normalizer.stats().malformed, 1);
    }

    #[test]
    fn test_tool_fragment_split_inside_character() {
        let headers = crate::streaming::headers::Headers::new()
            .with_str(crate::streaming::headers::MESSAGE_TYPE, "event")
            .with_str(crate::streaming::headers::EVENT_TYPE, "toolUseEvent");
        let head = crate::streaming::frame::encode_message(
            &headers,
            b"{\"toolUseId\":\"t1\",\"name\":\"geo\",\"input\":\"{\\\"city\\\":\\\"Z\xC3\",\"stop\":false}",
        );
        let tail = crate::streaming::frame::encode_message(
            &headers,
            b"{\"toolUseId\":\"t1\",\"name\":\"geo\",\"input\":\"\xBCrich\\\"}\",\"stop\":true}",
        );

        let mut normalizer = EventNormalizer::new();
        let mut fragments = Vec::new();
        for frame in [head, tail] {
            for message in EventStreamDecoder::new().feed(&frame) {
                for event in normalizer.normalize(&message) {
                    match event {
                        UpstreamEvent::ToolFragment { fragment, .. } => fragments.push(fragment),
                        other => panic!("Expected tool fragment, got {:?}", other),
                    }
                }
            }
        }

        assert_eq!(normalizer.stats().malformed, 0);
        assert_eq!(fragments[0], b"{\"city\":\"Z\xC3".to_vec());
        assert_eq!(fragments[1], b"\xBCrich\"}".to_vec());
        assert_eq!(fragments.concat(), "{\"city\":\"Z\u{fc}rich\"}".as_bytes());
    }

    #[test]
    fn test_content_length_exception() {
        let events = normalize_one(encode_error(
            "exception",
            "ContentLengthExceededException",
            &json!({"message": "Input is too long"}),
        ));
        assert_eq!(events.len(), 1);
        assert!(events[0].is_content_length_exceeded());
        match &events[0] {
            UpstreamEvent::Error { kind, message, .. } => {
                assert_eq!(*kind, UpstreamErrorKind::Exception);
                assert_eq!(message, "Input is too long");
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_reason_in_payload() {
        let events = normalize_one(encode_error(
            "error",
            "ValidationException",
            &json!({"message": "nope", "reason": "CONTENT_LENGTH_EXCEEDS_THRESHOLD"}),
        ));
        assert!(events[0].is_content_length_exceeded());

        let events = normalize_one(encode_error(
            "error",
            "ValidationException",
            &json!({"message": "bad request"}),
        ));
        assert!(!events[0].is_content_length_exceeded());

        let events = normalize_one(encode_error(
            "error",
            "CONTENT_LENGTH_EXCEEDS_THRESHOLD",
            &json!({"message": "too long"}),
        ));
        assert!(events[0].is_content_length_exceeded());
    }
}
