//! The tagged event variants produced by the agent's structured response and
//! by parsing a bridged CLI's NDJSON stream.

use serde::{Deserialize, Serialize};

/// One ordered unit of agent or bridge output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    /// A plain text chunk.
    Text {
        /// The text content.
        content: String,
    },
    /// A model "thinking" chunk, not shown as the final answer.
    Thinking {
        /// The thinking content.
        content: String,
    },
    /// A completed tool invocation, with its input summary and result text
    /// joined by a correlation id so callers can pair calls with results.
    ToolCall {
        /// The tool's name.
        tool_name: String,
        /// A short human-readable summary of the call's input.
        input_summary: String,
        /// The tool's result text, if the result has arrived.
        result: Option<String>,
        /// Opaque id correlating a `tool_use` block with its `tool_result`.
        call_id: String,
    },
}

impl Event {
    /// Returns this event's text content if it is a [`Event::Text`] variant.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Event::Text { content } => Some(content),
            _ => None,
        }
    }
}

/// Finds the content of the last [`Event::Text`] in `events`, or an empty
/// string if none is present. This is the router's and bridge's shared rule
/// for "final text" extraction.
#[must_use]
pub fn final_text(events: &[Event]) -> String {
    events
        .iter()
        .rev()
        .find_map(Event::as_text)
        .unwrap_or_default()
        .to_string()
}
