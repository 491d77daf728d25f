//! Turns backend stream events into ordered part updates

use std::collections::HashMap;

use parley_api::{
    Artifact, ArtifactKind, ArtifactStatus, FinishStatus, JsonMap, MessagePart, StreamEvent,
    ToolCall, ToolCallStatus,
};

use crate::error::{Error, Result};

/// A single update to the in-flight assistant message
#[derive(Debug, Clone, PartialEq)]
pub enum PartOp {
    AppendText(String),
    StartToolCall {
        id: String,
        name: String,
    },
    UpdateToolCall {
        id: String,
        status: ToolCallStatus,
        arguments: Option<JsonMap>,
    },
    StartArtifact {
        id: String,
        kind: ArtifactKind,
        title: String,
        language: String,
    },
    UpdateArtifact {
        id: String,
        status: ArtifactStatus,
        content_delta: Option<String>,
    },
    Finalize(FinishStatus),
}

/// Conversation identity carried by the stream
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConversationMeta {
    pub conversation_id: String,
    pub title: Option<String>,
    pub message_id: Option<String>,
    pub response_id: Option<String>,
}

/// What a backend event means for the session
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Op(PartOp),
    Conversation(ConversationMeta),
    Failed(String),
}

impl From<StreamEvent> for Step {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Conversation {
                conversation_id,
                title,
                message_id,
                response_id,
            } => Step::Conversation(ConversationMeta {
                conversation_id,
                title,
                message_id,
                response_id,
            }),
            StreamEvent::Text { content } => Step::Op(PartOp::AppendText(content)),
            StreamEvent::ToolCallStart { id, name } => Step::Op(PartOp::StartToolCall { id, name }),
            StreamEvent::ToolCallUpdate {
                id,
                status,
                arguments,
            } => Step::Op(PartOp::UpdateToolCall {
                id,
                status,
                arguments,
            }),
            StreamEvent::ArtifactStart {
                id,
                kind,
                title,
                language,
            } => Step::Op(PartOp::StartArtifact {
                id,
                kind,
                title,
                language,
            }),
            StreamEvent::ArtifactUpdate {
                id,
                status,
                content_delta,
            } => Step::Op(PartOp::UpdateArtifact {
                id,
                status,
                content_delta,
            }),
            StreamEvent::Finish { status } => Step::Op(PartOp::Finalize(status)),
            StreamEvent::Error { message } => Step::Failed(message),
        }
    }
}

/// Result of applying one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The part at this index was appended or changed
    Part(usize),
    /// The message is over
    Finalized(FinishStatus),
}

/// Applies part operations in arrival order.
///
/// The only state is the index-by-id map for tool calls and artifacts of the
/// current message; it is dropped on finalize.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    index: HashMap<String, usize>,
    finalized: bool,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one operation to `parts`, keeping artifact bodies in `artifacts`
    pub fn apply(
        &mut self,
        op: PartOp,
        parts: &mut Vec<MessagePart>,
        artifacts: &mut HashMap<String, Artifact>,
    ) -> Result<Applied> {
        if self.finalized {
            return Err(Error::Protocol("update after the message was finalized".into()));
        }

        match op {
            PartOp::AppendText(content) => {
                parts.push(MessagePart::Text { content });
                Ok(Applied::Part(parts.len() - 1))
            }
            PartOp::StartToolCall { id, name } => {
                let index = self.claim(&id, parts.len())?;
                parts.push(MessagePart::ToolCall {
                    tool_call: ToolCall::new(id, name),
                });
                Ok(Applied::Part(index))
            }
            PartOp::UpdateToolCall {
                id,
                status,
                arguments,
            } => {
                let index = self.lookup(&id)?;
                match parts.get_mut(index) {
                    Some(MessagePart::ToolCall { tool_call }) => {
                        if tool_call.status.is_terminal() {
                            return Err(Error::Protocol(format!(
                                "tool call '{}' is already {:?}",
                                id, tool_call.status
                            )));
                        }
                        tool_call.status = status;
                        if arguments.is_some() {
                            tool_call.arguments = arguments;
                        }
                        Ok(Applied::Part(index))
                    }
                    _ => Err(Error::Protocol(format!("part '{}' is not a tool call", id))),
                }
            }
            PartOp::StartArtifact {
                id,
                kind,
                title,
                language,
            } => {
                let index = self.claim(&id, parts.len())?;
                let artifact = Artifact::new(id.clone(), kind, title, language);
                parts.push(MessagePart::Artifact {
                    artifact: artifact.summary.clone(),
                });
                artifacts.insert(id, artifact);
                Ok(Applied::Part(index))
            }
            PartOp::UpdateArtifact {
                id,
                status,
                content_delta,
            } => {
                let index = self.lookup(&id)?;
                match parts.get_mut(index) {
                    Some(MessagePart::Artifact { artifact: summary }) => {
                        if summary.status.is_terminal() {
                            return Err(Error::Protocol(format!(
                                "artifact '{}' is already {:?}",
                                id, summary.status
                            )));
                        }
                        summary.status = status;
                        let body = artifacts.entry(id).or_insert_with(|| Artifact {
                            summary: summary.clone(),
                            content: String::new(),
                        });
                        body.summary.status = status;
                        if let Some(delta) = content_delta {
                            body.content.push_str(&delta);
                        }
                        Ok(Applied::Part(index))
                    }
                    _ => Err(Error::Protocol(format!("part '{}' is not an artifact", id))),
                }
            }
            PartOp::Finalize(status) => {
                self.reset();
                self.finalized = true;
                Ok(Applied::Finalized(status))
            }
        }
    }

    /// Drop the index map (stream finalized or cancelled)
    pub fn reset(&mut self) {
        self.index.clear();
    }

    fn claim(&mut self, id: &str, index: usize) -> Result<usize> {
        if self.index.contains_key(id) {
            return Err(Error::Protocol(format!("part id '{}' announced twice", id)));
        }
        self.index.insert(id.to_string(), index);
        Ok(index)
    }

    fn lookup(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::Protocol(format!("update for unknown part id '{}'", id)))
    }
}
