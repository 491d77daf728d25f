//! Session event types

use parley_api::{Message, MessagePart};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Where the session is in its send/receive cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No request outstanding
    #[default]
    Idle,
    /// Request sent, waiting for the first event
    Loading,
    /// Receiving and assembling parts
    Streaming,
}

impl SessionStatus {
    pub fn is_busy(&self) -> bool {
        !matches!(self, SessionStatus::Idle)
    }
}

/// Events emitted by a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Session status changed
    StatusChanged { status: SessionStatus },

    /// The optimistic user message was appended
    UserMessage { message: Message },

    /// The assistant message was created for this reply
    AssistantStart { message: Message },

    /// A part of the assistant message was appended or updated in place
    PartUpdated { index: usize, part: MessagePart },

    /// The backend assigned the conversation id
    ConversationAssigned { conversation_id: String },

    /// The assistant message reached a terminal status
    AssistantEnd { message: Message },

    /// A send failed
    Error { kind: ErrorKind, message: String },

    /// The session was reset or switched conversations
    Reset { conversation_id: Option<String> },
}

impl SessionEvent {
    /// Check if this event ends a send
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::AssistantEnd { .. } | SessionEvent::Error { .. }
        )
    }
}
