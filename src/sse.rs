//! Line framing for the model's streaming responses. Chunk boundaries are
//! unrelated to the `data: <json>\n\n` framing, so lines are reassembled in
//! a byte buffer and decoded only once complete.

use crate::protocol::{ChatChunk, ToolCallDelta};

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "data: [DONE]";

/// One decoded frame of the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    ToolCall(ToolCallFragment),
    Done,
}

/// Tool-call portion of one delta frame. `id` and `name` only appear on
/// the frame that opens the call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

impl From<ToolCallDelta> for ToolCallFragment {
    fn from(delta: ToolCallDelta) -> Self {
        Self {
            id: delta.id,
            name: delta.function.name,
            arguments: delta.function.arguments.unwrap_or_default(),
        }
    }
}

/// Reassembles newline-terminated lines from arbitrary byte chunks.
/// Splitting on raw `\n` is safe in UTF-8 (continuation bytes are >= 0x80),
/// so multi-byte characters survive chunk boundaries.
#[derive(Debug, Default)]
pub struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// End-of-stream flush: the buffered partial line, if any.
    pub fn finish(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}

/// Decode one logical line into zero or more events. Non-data lines and
/// malformed payloads yield nothing; a bad frame never terminates the
/// stream.
pub fn decode_line(line: &str) -> Vec<StreamEvent> {
    if line == DONE_SENTINEL {
        return vec![StreamEvent::Done];
    }
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return Vec::new();
    };

    let chunk: ChatChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(err) => {
            tracing::warn!(%err, "dropping malformed stream frame");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                events.push(StreamEvent::Content(content));
            }
        }
        if let Some(calls) = choice.delta.tool_calls {
            if let Some(call) = calls.into_iter().next() {
                events.push(StreamEvent::ToolCall(call.into()));
            }
        }
    }
    events
}
