//! Core types shared between the backend and the session engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Arbitrary JSON object (tool arguments, message metadata)
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Lifecycle of a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Created,
    InProgress,
    Completed,
    Error,
}

impl MessageStatus {
    /// Completed and errored messages are frozen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Lifecycle of a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Created,
    InProgress,
    Waiting,
    Preparing,
    Completed,
    Error,
}

impl ToolCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// A tool invocation announced by the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub status: ToolCallStatus,
    pub arguments: Option<JsonMap>,
}

impl ToolCall {
    /// A freshly announced tool call
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ToolCallStatus::Created,
            arguments: None,
        }
    }
}

/// Artifact flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Text,
    Code,
}

/// Lifecycle of a generated artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Created,
    InProgress,
    Completed,
    Error,
}

impl ArtifactStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Where the UI should place an artifact panel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
}

/// An artifact without its content body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub id: String,
    #[serde(rename = "name")]
    pub kind: ArtifactKind,
    pub title: String,
    pub language: String,
    pub status: ArtifactStatus,
    #[serde(rename = "isVisible", default)]
    pub is_visible: bool,
    #[serde(
        rename = "boundingBox",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bounding_box: Option<BoundingBox>,
}

/// A generated document or code block, body included
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(flatten)]
    pub summary: ArtifactSummary,
    pub content: String,
}

impl Artifact {
    pub fn new(
        id: impl Into<String>,
        kind: ArtifactKind,
        title: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            summary: ArtifactSummary {
                id: id.into(),
                kind,
                title: title.into(),
                language: language.into(),
                status: ArtifactStatus::Created,
                is_visible: true,
                bounding_box: None,
            },
            content: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.summary.id
    }
}

/// One typed fragment of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { content: String },
    ToolCall { tool_call: ToolCall },
    Artifact { artifact: ArtifactSummary },
}

impl MessagePart {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { content } => Some(content),
            _ => None,
        }
    }

    /// Id of the tool call or artifact this part holds, if any
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::Text { .. } => None,
            Self::ToolCall { tool_call } => Some(&tool_call.id),
            Self::Artifact { artifact } => Some(&artifact.id),
        }
    }
}

/// One turn in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub role: Role,
    pub status: MessageStatus,
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a completed user message with a single text part
    pub fn user(text: impl Into<String>, conversation_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_title: None,
            conversation_id,
            message_id: None,
            response_id: None,
            role: Role::User,
            status: MessageStatus::Completed,
            parts: vec![MessagePart::text(text)],
            metadata: None,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Create an empty in-progress assistant message
    pub fn assistant_in_progress(conversation_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_title: None,
            conversation_id,
            message_id: None,
            response_id: None,
            role: Role::Assistant,
            status: MessageStatus::InProgress,
            parts: vec![],
            metadata: None,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Combined text of all text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Find a tool call part by id
    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.parts.iter().find_map(|p| match p {
            MessagePart::ToolCall { tool_call } if tool_call.id == id => Some(tool_call),
            _ => None,
        })
    }

    /// Find an artifact part by id
    pub fn artifact(&self, id: &str) -> Option<&ArtifactSummary> {
        self.parts.iter().find_map(|p| match p {
            MessagePart::Artifact { artifact } if artifact.id == id => Some(artifact),
            _ => None,
        })
    }

    /// Stamp `updated_at` with the current time
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

/// A model the backend can route to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub provider: String,
}

impl AiModel {
    /// Fill in `group`/`provider` when the backend left them out
    pub fn normalized(mut self) -> Self {
        let is_gpt = self.name.contains("gpt");
        if self.group.is_empty() {
            self.group = if is_gpt { "OpenAI" } else { "Other" }.to_string();
        }
        if self.provider.is_empty() {
            self.provider = if is_gpt { "openai" } else { "other" }.to_string();
        }
        self
    }
}

/// Entry in the conversation list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored message as returned by the history endpoint
///
/// `parts` arrives as a JSON-encoded string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub conversation_title: Option<String>,
    pub conversation_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub response_id: Option<String>,
    pub role: Role,
    pub status: MessageStatus,
    #[serde(default)]
    pub parts: String,
    #[serde(default)]
    pub metadata: Option<JsonMap>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    /// Decode the embedded parts string into a full message
    pub fn into_message(self) -> serde_json::Result<Message> {
        let parts = if self.parts.trim().is_empty() {
            vec![]
        } else {
            serde_json::from_str(&self.parts)?
        };
        Ok(Message {
            conversation_title: self.conversation_title,
            conversation_id: Some(self.conversation_id),
            message_id: self.message_id,
            response_id: self.response_id,
            role: self.role,
            status: self.status,
            parts,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// One page of conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub data: Vec<MessageRecord>,
    pub current_page: u32,
    pub last_page: u32,
    pub per_page: u32,
    #[serde(default)]
    pub from: Option<u32>,
    #[serde(default)]
    pub to: Option<u32>,
    pub total: u32,
    pub has_more: bool,
}

/// Reference to a file the backend has accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}
