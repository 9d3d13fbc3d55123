//! Payload shapes of upstream event-stream messages.

use serde::Deserialize;

/// `assistantResponseEvent` carrying streamed text
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseEvent {
    #[serde(default)]
    pub content: String,
    /// Set on the final response of a turn
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub message_status: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl AssistantResponseEvent {
    pub fn is_complete(&self) -> bool {
        self.stop || self.message_status.as_deref() == Some("COMPLETED")
    }
}

/// `toolUseEvent`: one fragment of a tool invocation's arguments
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseEvent {
    pub tool_use_id: String,
    pub name: String,
    /// String fragment, or occasionally an already-structured object
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub stop: bool,
}

impl ToolUseEvent {
    /// Argument fragment as text
    pub fn fragment(&self) -> String {
        match &self.input {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// `completion`: a whole response in one event
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// `completionChunk`: a streamed piece of text
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionChunkEvent {
    #[serde(default, alias = "content")]
    pub delta: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// `toolCallRequest`: a complete tool invocation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequestEvent {
    #[serde(alias = "toolUseId")]
    pub tool_call_id: String,
    pub name: String,
    /// Object, or a JSON document encoded as a string
    #[serde(default, alias = "input")]
    pub arguments: serde_json::Value,
}

/// `toolCallError`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallErrorEvent {
    #[serde(alias = "toolUseId")]
    pub tool_call_id: String,
    #[serde(default, alias = "message")]
    pub error: String,
}

/// `sessionStart` / `sessionEnd`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
}

/// Body of an `error` or `exception` message
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamErrorPayload {
    #[serde(default, alias = "Message")]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, rename = "__type")]
    pub error_type: Option<String>,
}
