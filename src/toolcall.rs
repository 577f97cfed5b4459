use crate::protocol::{ToolCall, ToolCallFunction};
use crate::sse::ToolCallFragment;

/// Accumulates a tool call that arrives fragmented across stream frames.
/// The wire format has no end-of-arguments marker, so completion is
/// "does the buffer parse as JSON", re-evaluated on every fragment.
#[derive(Debug, Clone, Default)]
pub struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fragment carrying a non-empty id names the call; every fragment
    /// appends its arguments slice.
    pub fn ingest(&mut self, fragment: &ToolCallFragment) {
        if let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) {
            self.id = id.to_string();
            if let Some(name) = fragment.name.as_deref() {
                self.name = name.to_string();
            }
        }
        self.arguments.push_str(&fragment.arguments);
    }

    pub fn is_complete(&self) -> bool {
        !self.id.is_empty()
            && serde_json::from_str::<serde_json::Value>(&self.arguments).is_ok()
    }

    /// The finalized call, or `None` if the stream never opened one.
    pub fn into_call(self) -> Option<ToolCall> {
        if self.id.is_empty() {
            return None;
        }
        Some(ToolCall {
            id: self.id,
            kind: "function".to_string(),
            function: ToolCallFunction {
                name: self.name,
                arguments: self.arguments,
            },
        })
    }
}
