use serde::{Deserialize, Serialize};

/// Claude Messages API Request
///
/// Only the fields the gateway inspects are typed; the raw body is forwarded
/// upstream untouched.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeRequest {
    /// Model identifier (e.g., "claude-sonnet-4-5")
    pub model: String,

    /// Conversation history
    pub messages: Vec<ClaudeMessage>,

    /// Optional system prompt (top-level field)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<serde_json::Value>,

    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Enable streaming
    #[serde(default)]
    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeMessage {
    /// "user" or "assistant"
    pub role: String,

    /// Either a string or array of content blocks
    pub content: serde_json::Value,
}

/// Why a response ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::ToolUse => "tool_use",
        }
    }
}

/// Claude SSE Event Types
///
/// The canonical outbound event set of a response stream. Each variant
/// serializes to the JSON `data` of one SSE event named by [`event_name`].
///
/// [`event_name`]: StreamEvent::event_name
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageMetadata },

    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: usize,
        content_block: ContentBlockMetadata,
    },

    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: Delta },

    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },

    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: MessageDeltaData,
        usage: UsageInfo,
    },

    #[serde(rename = "message_stop")]
    MessageStop,

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "error")]
    Error { error: ErrorInfo },
}

impl StreamEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// JSON payload of the event
    pub fn data(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn text_delta(index: usize, text: impl Into<String>) -> Self {
        StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta { text: text.into() },
        }
    }

    pub fn input_json_delta(index: usize, partial_json: impl Into<String>) -> Self {
        StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJsonDelta {
                partial_json: partial_json.into(),
            },
        }
    }

    pub fn tool_use_start(index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlockMetadata::ToolUse {
                id: id.into(),
                name: name.into(),
                input: serde_json::json!({}),
            },
        }
    }

    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: ErrorInfo {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageMetadata {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: String, // "message"
    pub role: String, // "assistant"
    pub model: String,
    pub content: Vec<serde_json::Value>,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: UsageInfo,
}

impl MessageMetadata {
    pub fn new(id: String, model: String, input_tokens: u32) -> Self {
        Self {
            id,
            msg_type: "message".to_string(),
            role: "assistant".to_string(),
            model,
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: UsageInfo {
                input_tokens,
                output_tokens: 0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ContentBlockMetadata {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageDeltaData {
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Non-streaming Messages API response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ResponseContent>,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: UsageInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ResponseContent {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_request() {
        let json = r#"{
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "Hello"}
            ],
            "max_tokens": 100,
            "stream": true
        }"#;

        let req: ClaudeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.model, "claude-sonnet-4-5");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.max_tokens, Some(100));
        assert!(req.stream);
    }

    #[test]
    fn test_parse_content_blocks() {
        let json = r#"{
            "model": "claude-sonnet-4-5",
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "Hello"},
                        {"type": "text", "text": "World"}
                    ]
                }
            ]
        }"#;

        let req: ClaudeRequest = serde_json::from_str(json).unwrap();
        assert!(!req.stream);
        assert_eq!(req.messages[0].content.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = StreamEvent::tool_use_start(1, "toolu_1", "get_weather");
        assert_eq!(event.event_name(), "content_block_start");
        assert_eq!(
            event.data(),
            serde_json::json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": {
                    "type": "tool_use",
                    "id": "toolu_1",
                    "name": "get_weather",
                    "input": {}
                }
            })
        );

        let delta = StreamEvent::input_json_delta(1, "{\"a\":");
        assert_eq!(delta.data()["delta"]["type"], "input_json_delta");
        assert_eq!(delta.data()["delta"]["partial_json"], "{\"a\":");

        assert_eq!(
            StreamEvent::MessageStop.data(),
            serde_json::json!({"type": "message_stop"})
        );
    }

    #[test]
    fn test_message_delta_serialization() {
        let event = StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(StopReason::ToolUse),
                stop_sequence: None,
            },
            usage: UsageInfo {
                input_tokens: 10,
                output_tokens: 5,
            },
        };
        let data = event.data();
        assert_eq!(data["delta"]["stop_reason"], "tool_use");
        assert_eq!(data["usage"]["output_tokens"], 5);
    }
}
