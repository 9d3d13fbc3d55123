//! Outbound protocol state machine.
//!
//! Every event bound for the client passes through [`OutboundStateMachine`],
//! which guarantees start-before-delta-before-stop per block and a single
//! terminal delta per message. In lenient mode violations are logged and the
//! offending event dropped; in strict mode they abort with an error.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::ProtocolMode;
use crate::error::{ProxyError, Result};
use crate::models::claude::{ContentBlockMetadata, Delta, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    ToolUse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockState {
    pub index: usize,
    pub kind: BlockKind,
    pub started: bool,
    pub stopped: bool,
    pub tool_id: Option<String>,
}

impl BlockState {
    fn is_open(&self) -> bool {
        self.started && !self.stopped
    }
}

#[derive(Debug)]
pub struct OutboundStateMachine {
    mode: ProtocolMode,
    message_started: bool,
    delta_sent: bool,
    message_stopped: bool,
    blocks: BTreeMap<usize, BlockState>,
    violations: usize,
}

impl OutboundStateMachine {
    pub fn new(mode: ProtocolMode) -> Self {
        Self {
            mode,
            message_started: false,
            delta_sent: false,
            message_stopped: false,
            blocks: BTreeMap::new(),
            violations: 0,
        }
    }

    pub fn lenient() -> Self {
        Self::new(ProtocolMode::Lenient)
    }

    pub fn strict() -> Self {
        Self::new(ProtocolMode::Strict)
    }

    pub fn mode(&self) -> ProtocolMode {
        self.mode
    }

    pub fn violations(&self) -> usize {
        self.violations
    }

    pub fn message_started(&self) -> bool {
        self.message_started
    }

    pub fn delta_sent(&self) -> bool {
        self.delta_sent
    }

    pub fn message_stopped(&self) -> bool {
        self.message_stopped
    }

    pub fn block(&self, index: usize) -> Option<&BlockState> {
        self.blocks.get(&index)
    }

    pub fn is_block_stopped(&self, index: usize) -> bool {
        self.blocks.get(&index).is_some_and(|block| block.stopped)
    }

    /// Indices of blocks started but not stopped, ascending
    pub fn open_blocks(&self) -> Vec<usize> {
        self.blocks
            .values()
            .filter(|block| block.is_open())
            .map(|block| block.index)
            .collect()
    }

    /// Validate one event and return what should actually be written
    pub fn process(&mut self, event: StreamEvent) -> Result<Vec<StreamEvent>> {
        match event {
            StreamEvent::MessageStart { .. } => {
                if self.message_started {
                    return self.violation("message_start sent twice");
                }
                self.message_started = true;
                Ok(vec![event])
            }
            StreamEvent::ContentBlockStart {
                index,
                ref content_block,
            } => {
                if let Some(reason) = self.closed_reason() {
                    return self.violation(&format!("content_block_start {}", reason));
                }
                if self.blocks.get(&index).is_some_and(BlockState::is_open) {
                    return self.violation(&format!("content_block_start for open index {}", index));
                }
                let (kind, tool_id) = match content_block {
                    ContentBlockMetadata::Text { .. } => (BlockKind::Text, None),
                    ContentBlockMetadata::ToolUse { id, .. } => {
                        (BlockKind::ToolUse, Some(id.clone()))
                    }
                };
                let mut out = Vec::new();
                if kind == BlockKind::ToolUse {
                    out.extend(self.stop_open_text_blocks());
                }
                self.open_block(index, kind, tool_id);
                out.push(event);
                Ok(out)
            }
            StreamEvent::ContentBlockDelta { index, ref delta } => {
                if let Some(reason) = self.closed_reason() {
                    return self.violation(&format!("content_block_delta {}", reason));
                }
                match self.blocks.get(&index).map(|block| block.stopped) {
                    Some(true) => {
                        self.violation(&format!("content_block_delta for stopped block {}", index))
                    }
                    Some(false) => Ok(vec![event]),
                    None => {
                        let mut out = self.synthesize_start(index, delta);
                        out.push(event);
                        Ok(out)
                    }
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                match self.blocks.get(&index).map(BlockState::is_open) {
                    Some(true) => {
                        if let Some(block) = self.blocks.get_mut(&index) {
                            block.stopped = true;
                        }
                        Ok(vec![event])
                    }
                    Some(false) => {
                        self.violation(&format!("content_block_stop for stopped block {}", index))
                    }
                    None => {
                        self.violation(&format!("content_block_stop for unstarted block {}", index))
                    }
                }
            }
            StreamEvent::MessageDelta { .. } => {
                if let Some(reason) = self.closed_reason() {
                    return self.violation(&format!("message_delta {}", reason));
                }
                if self.delta_sent {
                    return self.violation("message_delta sent twice");
                }
                self.delta_sent = true;
                let mut out = self.stop_all_open_blocks();
                out.push(event);
                Ok(out)
            }
            StreamEvent::MessageStop => {
                if let Some(reason) = self.closed_reason() {
                    return self.violation(&format!("message_stop {}", reason));
                }
                self.message_stopped = true;
                let mut out = self.stop_all_open_blocks();
                out.push(event);
                Ok(out)
            }
            StreamEvent::Ping | StreamEvent::Error { .. } => Ok(vec![event]),
        }
    }

    /// Synthetic stops for every open block, ascending by index
    pub fn close_open_blocks(&mut self) -> Vec<StreamEvent> {
        self.stop_all_open_blocks()
    }

    fn closed_reason(&self) -> Option<&'static str> {
        if !self.message_started {
            Some("before message_start")
        } else if self.message_stopped {
            Some("after message_stop")
        } else {
            None
        }
    }

    fn open_block(&mut self, index: usize, kind: BlockKind, tool_id: Option<String>) {
        self.blocks.insert(
            index,
            BlockState {
                index,
                kind,
                started: true,
                stopped: false,
                tool_id,
            },
        );
    }

    fn synthesize_start(&mut self, index: usize, delta: &Delta) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        let start = match delta {
            Delta::TextDelta { .. } => {
                self.open_block(index, BlockKind::Text, None);
                StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlockMetadata::Text {
                        text: String::new(),
                    },
                }
            }
            Delta::InputJsonDelta { .. } => {
                out.extend(self.stop_open_text_blocks());
                let id = format!("toolu_{}", uuid::Uuid::new_v4().simple());
                self.open_block(index, BlockKind::ToolUse, Some(id.clone()));
                StreamEvent::tool_use_start(index, id, "")
            }
        };
        debug!(index, "Synthesized content_block_start");
        out.push(start);
        out
    }

    fn stop_open_text_blocks(&mut self) -> Vec<StreamEvent> {
        self.stop_where(|block| block.kind == BlockKind::Text)
    }

    fn stop_all_open_blocks(&mut self) -> Vec<StreamEvent> {
        self.stop_where(|_| true)
    }

    fn stop_where(&mut self, filter: impl Fn(&BlockState) -> bool) -> Vec<StreamEvent> {
        self.blocks
            .values_mut()
            .filter(|block| block.is_open() && filter(block))
            .map(|block| {
                block.stopped = true;
                debug!(index = block.index, "Auto-closing open block");
                StreamEvent::ContentBlockStop { index: block.index }
            })
            .collect()
    }

    fn violation(&mut self, message: &str) -> Result<Vec<StreamEvent>> {
        self.violations += 1;
        match self.mode {
            ProtocolMode::Strict => Err(ProxyError::ProtocolViolation(message.to_string())),
            ProtocolMode::Lenient => {
                warn!(violation = message, "Dropping out-of-order event");
                Ok(Vec::new())
            }
        }
    }
}
