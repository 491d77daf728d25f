//! Streaming event types and utilities

use crate::error::{Error, Result};
use crate::types::{ArtifactKind, ArtifactStatus, JsonMap, ToolCallStatus};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// How the backend ended a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    Completed,
    Error,
}

/// Events emitted by the chat stream endpoint, in arrival order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Conversation identity for this reply
    Conversation {
        conversation_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        response_id: Option<String>,
    },
    /// Append a text span
    Text { content: String },
    /// A tool call was announced
    ToolCallStart { id: String, name: String },
    /// A known tool call advanced
    ToolCallUpdate {
        id: String,
        status: ToolCallStatus,
        #[serde(default)]
        arguments: Option<JsonMap>,
    },
    /// An artifact was announced
    ArtifactStart {
        id: String,
        kind: ArtifactKind,
        title: String,
        #[serde(default)]
        language: String,
    },
    /// A known artifact advanced
    ArtifactUpdate {
        id: String,
        status: ArtifactStatus,
        #[serde(default)]
        content_delta: Option<String>,
    },
    /// The reply is over
    Finish { status: FinishStatus },
    /// The backend gave up mid-reply
    Error { message: String },
}

impl StreamEvent {
    /// Check if this is a terminal event (Finish or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish { .. } | StreamEvent::Error { .. })
    }
}

/// A stream of decoded backend events
pub type StreamEventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Marker some backends send after the last event
pub const DONE_SENTINEL: &str = "[DONE]";

/// Decode one SSE `data:` payload.
///
/// Returns `None` for the end-of-stream sentinel.
pub fn parse_event_data(data: &str) -> Option<Result<StreamEvent>> {
    let data = data.trim();
    if data == DONE_SENTINEL {
        return None;
    }
    Some(
        serde_json::from_str(data)
            .map_err(|e| Error::MalformedEvent(format!("{} in payload {:?}", e, truncate(data, 120)))),
    )
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
