use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events written to a chat response stream.
///
/// Each event is serialized to one JSON string so the stream can be buffered
/// and replayed verbatim to a client that reattaches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    /// The assistant message is about to be produced
    Start {
        thread_id: Uuid,
        message_id: Uuid,
        stream_id: String,
    },

    /// A chunk of generated text
    Delta { text: String },

    /// The thread title is ready
    Title { title: String },

    /// The assistant message was persisted
    Finish { message_id: Uuid },

    /// Generation failed or the reply could not be stored
    Error { message: String },
}

impl ChatStreamEvent {
    pub fn to_json(&self) -> String {
        // Serializing this enum cannot fail: every field is a plain string or uuid.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }
}
