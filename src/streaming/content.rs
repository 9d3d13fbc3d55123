//! Assembles a complete message from the outbound event sequence.
//!
//! The non-streaming path runs the same pipeline as streaming and folds the
//! events it would have written into a single [`MessageResponse`].

use std::collections::BTreeMap;

use tracing::warn;

use crate::models::claude::{
    ContentBlockMetadata, Delta, ErrorInfo, MessageResponse, ResponseContent, StopReason,
    StreamEvent, UsageInfo,
};

/// Type of content block in a Claude message
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlockType {
    Text,
    ToolUse { id: String, name: String },
}

/// Represents a single content block with index tracking
#[derive(Debug, Clone)]
pub struct ContentBlock {
    pub index: usize,
    pub block_type: ContentBlockType,
    /// Accumulated text, or raw argument JSON for tool blocks
    pub content: String,
    pub is_complete: bool,
}

impl ContentBlock {
    pub fn new_text(index: usize) -> Self {
        Self {
            index,
            block_type: ContentBlockType::Text,
            content: String::new(),
            is_complete: false,
        }
    }

    pub fn new_tool_use(index: usize, id: String, name: String) -> Self {
        Self {
            index,
            block_type: ContentBlockType::ToolUse { id, name },
            content: String::new(),
            is_complete: false,
        }
    }

    fn into_response_content(self) -> Option<ResponseContent> {
        match self.block_type {
            ContentBlockType::Text if self.content.is_empty() => None,
            ContentBlockType::Text => Some(ResponseContent::Text { text: self.content }),
            ContentBlockType::ToolUse { id, name } => {
                let raw = self.content.trim();
                let input = if raw.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(raw).unwrap_or_else(|e| {
                        warn!(tool_use_id = %id, error = %e, "Tool input is not valid JSON");
                        serde_json::json!({})
                    })
                };
                Some(ResponseContent::ToolUse { id, name, input })
            }
        }
    }
}

/// Folds outbound events into blocks, keyed by index
#[derive(Debug, Default)]
pub struct ContentBlockManager {
    id: String,
    model: String,
    blocks: BTreeMap<usize, ContentBlock>,
    stop_reason: Option<StopReason>,
    usage: UsageInfo,
    error: Option<ErrorInfo>,
}

impl ContentBlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id.clone();
                self.model = message.model.clone();
                self.usage = message.usage;
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block {
                    ContentBlockMetadata::Text { text } => {
                        let mut block = ContentBlock::new_text(*index);
                        block.content.push_str(text);
                        block
                    }
                    ContentBlockMetadata::ToolUse { id, name, .. } => {
                        ContentBlock::new_tool_use(*index, id.clone(), name.clone())
                    }
                };
                self.blocks.insert(*index, block);
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let block = self
                    .blocks
                    .entry(*index)
                    .or_insert_with(|| ContentBlock::new_text(*index));
                match delta {
                    Delta::TextDelta { text } => block.content.push_str(text),
                    Delta::InputJsonDelta { partial_json } => block.content.push_str(partial_json),
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                if let Some(block) = self.blocks.get_mut(index) {
                    block.is_complete = true;
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                self.stop_reason = delta.stop_reason;
                self.usage = *usage;
            }
            StreamEvent::Error { error } => self.error = Some(error.clone()),
            StreamEvent::MessageStop | StreamEvent::Ping => {}
        }
    }

    pub fn get(&self, index: usize) -> Option<&ContentBlock> {
        self.blocks.get(&index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn has_tool_use(&self) -> bool {
        self.blocks
            .values()
            .any(|b| matches!(b.block_type, ContentBlockType::ToolUse { .. }))
    }

    /// Error event observed in the stream, if any
    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    /// Build the final response; empty text blocks are omitted
    pub fn into_response(self) -> MessageResponse {
        MessageResponse {
            id: self.id,
            msg_type: "message".to_string(),
            role: "assistant".to_string(),
            model: self.model,
            content: self
                .blocks
                .into_values()
                .filter_map(ContentBlock::into_response_content)
                .collect(),
            stop_reason: self.stop_reason,
            stop_sequence: None,
            usage: self.usage,
        }
    }
}
