//! Tool lifecycle tracking and content-block index allocation.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::models::claude::StreamEvent;

/// Index 0 is reserved for the text block
pub const TEXT_BLOCK_INDEX: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub id: String,
    pub name: String,
    pub status: ToolStatus,
    pub arguments: serde_json::Value,
    pub block_index: usize,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Allocates block indices to tools and produces their start/stop events.
///
/// Indices start at 1 and grow monotonically; an index is never handed
/// out twice within a response, even after its tool finished.
#[derive(Debug)]
pub struct ToolLifecycleManager {
    active: HashMap<String, ToolExecution>,
    finished: HashMap<String, ToolExecution>,
    next_index: usize,
    intro_sent: bool,
}

impl Default for ToolLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolLifecycleManager {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
            finished: HashMap::new(),
            next_index: TEXT_BLOCK_INDEX + 1,
            intro_sent: false,
        }
    }

    /// Register a tool, or update the arguments of one already known.
    ///
    /// The first tool of a response is preceded by an empty text delta on
    /// block 0 so clients see a text block before any tool block.
    pub fn register_or_update(
        &mut self,
        id: &str,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Vec<StreamEvent> {
        if self.finished.contains_key(id) {
            debug!(tool_use_id = id, "Ignoring event for finished tool");
            return Vec::new();
        }

        if let Some(tool) = self.active.get_mut(id) {
            if !is_empty_arguments(arguments) {
                tool.arguments = arguments.clone();
            }
            return Vec::new();
        }

        let mut events = Vec::new();
        if !self.intro_sent {
            self.intro_sent = true;
            events.push(StreamEvent::text_delta(TEXT_BLOCK_INDEX, ""));
        }

        let block_index = self.next_index;
        self.next_index += 1;

        info!(tool_use_id = id, tool = name, block_index, "Tool started");

        events.push(StreamEvent::tool_use_start(block_index, id, name));
        if !is_empty_arguments(arguments) {
            events.push(StreamEvent::input_json_delta(
                block_index,
                arguments.to_string(),
            ));
        }

        self.active.insert(
            id.to_string(),
            ToolExecution {
                id: id.to_string(),
                name: name.to_string(),
                status: ToolStatus::Running,
                arguments: arguments.clone(),
                block_index,
                started_at: Instant::now(),
                finished_at: None,
                result: None,
                error: None,
            },
        );

        events
    }

    /// Record parsed arguments for an active tool
    pub fn update_arguments(&mut self, id: &str, arguments: serde_json::Value) -> bool {
        match self.active.get_mut(id) {
            Some(tool) => {
                tool.arguments = arguments;
                true
            }
            None => false,
        }
    }

    /// Close a tool's block
    pub fn complete(&mut self, id: &str, result: Option<serde_json::Value>) -> Vec<StreamEvent> {
        let Some(mut tool) = self.active.remove(id) else {
            debug!(tool_use_id = id, "Complete requested for unknown tool");
            return Vec::new();
        };

        tool.status = ToolStatus::Completed;
        tool.finished_at = Some(Instant::now());
        tool.result = result;

        info!(
            tool_use_id = id,
            tool = %tool.name,
            elapsed_ms = tool.started_at.elapsed().as_millis() as u64,
            "Tool completed"
        );

        let index = tool.block_index;
        self.finished.insert(id.to_string(), tool);
        vec![StreamEvent::ContentBlockStop { index }]
    }

    /// Mark a tool failed: an error event followed by its block stop
    pub fn fail(&mut self, id: &str, message: &str) -> Vec<StreamEvent> {
        let Some(mut tool) = self.active.remove(id) else {
            warn!(tool_use_id = id, error = message, "Error reported for unknown tool");
            return vec![StreamEvent::error(
                "tool_error",
                format!("Tool {} failed: {}", id, message),
            )];
        };

        tool.status = ToolStatus::Error;
        tool.finished_at = Some(Instant::now());
        tool.error = Some(message.to_string());

        warn!(tool_use_id = id, tool = %tool.name, error = message, "Tool failed");

        let index = tool.block_index;
        let events = vec![
            StreamEvent::error(
                "tool_error",
                format!("Tool {} ({}) failed: {}", tool.name, id, message),
            ),
            StreamEvent::ContentBlockStop { index },
        ];
        self.finished.insert(id.to_string(), tool);
        events
    }

    /// Block index of an active or finished tool
    pub fn block_index(&self, id: &str) -> Option<usize> {
        self.active
            .get(id)
            .or_else(|| self.finished.get(id))
            .map(|tool| tool.block_index)
    }

    pub fn get(&self, id: &str) -> Option<&ToolExecution> {
        self.active.get(id).or_else(|| self.finished.get(id))
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    pub fn is_finished(&self, id: &str) -> bool {
        self.finished.contains_key(id)
    }

    /// Whether any tool was seen in this response
    pub fn has_tools(&self) -> bool {
        !self.active.is_empty() || !self.finished.is_empty()
    }

    pub fn tool_count(&self) -> usize {
        self.active.len() + self.finished.len()
    }

    /// Active tool ids in block order
    pub fn active_ids(&self) -> Vec<String> {
        let mut tools: Vec<&ToolExecution> = self.active.values().collect();
        tools.sort_by_key(|tool| tool.block_index);
        tools.into_iter().map(|tool| tool.id.clone()).collect()
    }
}

fn is_empty_arguments(arguments: &serde_json::Value) -> bool {
    match arguments {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}
