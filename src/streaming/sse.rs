use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::models::claude::{ContentBlockMetadata, Delta, StreamEvent};
use crate::models::openai::{ChatUsage, chat_id, finish_reason};

/// Public API dialect a client speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Anthropic,
    OpenAi,
}

/// Writes canonical events as Anthropic SSE frames
#[derive(Debug, Default)]
pub struct AnthropicSseEncoder;

impl AnthropicSseEncoder {
    pub fn encode(&mut self, event: &StreamEvent) -> Option<String> {
        Some(format!(
            "event: {}\ndata: {}\n\n",
            event.event_name(),
            event.data()
        ))
    }
}

/// Writes canonical events as OpenAI `chat.completion.chunk` frames
#[derive(Debug)]
pub struct OpenAiSseEncoder {
    id: String,
    model: String,
    created: u64,
    /// block index -> position in the `tool_calls` array
    tool_positions: HashMap<usize, usize>,
}

impl Default for OpenAiSseEncoder {
    fn default() -> Self {
        Self::new(unix_now())
    }
}

impl OpenAiSseEncoder {
    pub fn new(created: u64) -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            created,
            tool_positions: HashMap::new(),
        }
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Option<String> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = chat_id(&message.id);
                self.model = message.model.clone();
                Some(self.chunk(
                    serde_json::json!({"role": "assistant", "content": ""}),
                    None,
                    None,
                ))
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlockMetadata::ToolUse { id, name, .. },
            } => {
                let position = self.tool_positions.len();
                self.tool_positions.insert(*index, position);
                Some(self.chunk(
                    serde_json::json!({
                        "tool_calls": [{
                            "index": position,
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": ""}
                        }]
                    }),
                    None,
                    None,
                ))
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } if text.is_empty() => None,
                Delta::TextDelta { text } => {
                    Some(self.chunk(serde_json::json!({"content": text}), None, None))
                }
                Delta::InputJsonDelta { partial_json } => {
                    let position = *self.tool_positions.get(index)?;
                    Some(self.chunk(
                        serde_json::json!({
                            "tool_calls": [{
                                "index": position,
                                "function": {"arguments": partial_json}
                            }]
                        }),
                        None,
                        None,
                    ))
                }
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let reason = delta.stop_reason.map(finish_reason).unwrap_or("stop");
                Some(self.chunk(
                    serde_json::json!({}),
                    Some(reason),
                    Some(ChatUsage::from(*usage)),
                ))
            }
            StreamEvent::MessageStop => Some("data: [DONE]\n\n".to_string()),
            StreamEvent::Error { error } => {
                let data = serde_json::json!({
                    "error": {
                        "message": error.message,
                        "type": error.error_type
                    }
                });
                Some(format!("data: {}\n\n", data))
            }
            StreamEvent::ContentBlockStart { .. }
            | StreamEvent::ContentBlockStop { .. }
            | StreamEvent::Ping => None,
        }
    }

    fn chunk(
        &self,
        delta: serde_json::Value,
        finish_reason: Option<&str>,
        usage: Option<ChatUsage>,
    ) -> String {
        let mut data = serde_json::json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason
            }]
        });
        if let Some(usage) = usage {
            data["usage"] = serde_json::to_value(usage).unwrap_or(serde_json::Value::Null);
        }
        format!("data: {}\n\n", data)
    }
}

#[derive(Debug)]
pub enum SseEncoder {
    Anthropic(AnthropicSseEncoder),
    OpenAi(OpenAiSseEncoder),
}

impl SseEncoder {
    pub fn new(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Anthropic => SseEncoder::Anthropic(AnthropicSseEncoder),
            Dialect::OpenAi => SseEncoder::OpenAi(OpenAiSseEncoder::default()),
        }
    }

    /// Serialized frame for `event`, or `None` when the dialect has no equivalent
    pub fn encode(&mut self, event: &StreamEvent) -> Option<String> {
        match self {
            SseEncoder::Anthropic(encoder) => encoder.encode(event),
            SseEncoder::OpenAi(encoder) => encoder.encode(event),
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
