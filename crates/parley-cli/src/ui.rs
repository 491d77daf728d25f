//! Plain-text rendering of session state for the terminal

use parley_api::{AiModel, ConversationItem, Message, MessagePart, Role};
use parley_session::{FileStatus, FileWithStatus, ModelCatalog, SessionEvent};

/// What to print for one session event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Streamed text, printed without a newline
    Inline(String),
    /// A status line
    Line(String),
    /// An error line for stderr
    Error(String),
}

/// Writes rendered events to stdout/stderr, keeping streamed text on one line
#[derive(Debug, Default)]
pub struct Printer {
    mid_line: bool,
}

impl Printer {
    pub fn print(&mut self, event: &SessionEvent) {
        use std::io::Write;

        match render_event(event) {
            Some(Output::Inline(text)) => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
                self.mid_line = !text.ends_with('\n');
            }
            Some(Output::Line(line)) => {
                if self.mid_line {
                    println!();
                    self.mid_line = false;
                }
                if !line.is_empty() {
                    println!("{}", line);
                }
            }
            Some(Output::Error(message)) => {
                if self.mid_line {
                    println!();
                    self.mid_line = false;
                }
                eprintln!("Error: {}", message);
            }
            None => {}
        }
    }
}

/// Render a session event, or nothing for events the terminal ignores
pub fn render_event(event: &SessionEvent) -> Option<Output> {
    match event {
        SessionEvent::PartUpdated { part, .. } => match part {
            MessagePart::Text { content } => Some(Output::Inline(content.clone())),
            other => Some(Output::Line(render_part(other))),
        },
        // An empty line ends the streamed text
        SessionEvent::AssistantEnd { message } => {
            let note = match message.status {
                parley_api::MessageStatus::Error => {
                    let cancelled = message
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get("finish_reason"))
                        .and_then(|v| v.as_str())
                        == Some("cancelled");
                    if cancelled { "[stopped]" } else { "[reply failed]" }
                }
                _ => "",
            };
            Some(Output::Line(note.to_string()))
        }
        SessionEvent::Error { message, .. } => Some(Output::Error(message.clone())),
        SessionEvent::ConversationAssigned { conversation_id } => {
            Some(Output::Line(format!("[/chat/{}]", conversation_id)))
        }
        SessionEvent::StatusChanged { .. }
        | SessionEvent::UserMessage { .. }
        | SessionEvent::AssistantStart { .. }
        | SessionEvent::Reset { .. } => None,
    }
}

/// One-line summary of a non-text part
pub fn render_part(part: &MessagePart) -> String {
    match part {
        MessagePart::Text { content } => content.clone(),
        MessagePart::ToolCall { tool_call } => {
            let status = serde_label(&tool_call.status);
            match &tool_call.arguments {
                Some(args) if tool_call.status.is_terminal() => format!(
                    "[tool {} {}: {}]",
                    tool_call.name,
                    status,
                    serde_json::Value::Object(args.clone())
                ),
                _ => format!("[tool {} {}]", tool_call.name, status),
            }
        }
        MessagePart::Artifact { artifact } => {
            let language = if artifact.language.is_empty() {
                String::new()
            } else {
                format!(" ({})", artifact.language)
            };
            format!(
                "[artifact \"{}\"{} {}]",
                artifact.title,
                language,
                serde_label(&artifact.status)
            )
        }
    }
}

/// Render a stored message for history display
pub fn render_message(message: &Message) -> String {
    let who = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    let body: Vec<String> = message.parts.iter().map(render_part).collect();
    format!("{}> {}", who, body.join(""))
}

pub fn render_files(files: &[FileWithStatus]) -> String {
    if files.is_empty() {
        return "No files attached.".to_string();
    }
    files
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let status = match f.status {
                FileStatus::Error => format!(
                    "error: {}",
                    f.error.as_deref().unwrap_or("unknown reason")
                ),
                other => serde_label(&other),
            };
            format!("  {}. {} ({} bytes) {}", i + 1, f.file.name, f.file.size(), status)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_models(catalog: &ModelCatalog) -> String {
    if catalog.is_empty() {
        return "No models available.".to_string();
    }
    let selected = catalog.selected().map(|m| m.id.as_str());
    let mut lines = vec![];
    for group in catalog.groups() {
        lines.push(format!("{}:", group));
        for model in catalog.in_group(group) {
            lines.push(render_model(model, selected == Some(model.id.as_str())));
        }
    }
    lines.join("\n")
}

fn render_model(model: &AiModel, selected: bool) -> String {
    let marker = if selected { "*" } else { " " };
    if model.description.is_empty() {
        format!(" {} {}", marker, model.id)
    } else {
        format!(" {} {} - {}", marker, model.id, model.description)
    }
}

pub fn render_conversations(items: &[ConversationItem]) -> String {
    if items.is_empty() {
        return "No conversations yet.".to_string();
    }
    items
        .iter()
        .map(|item| {
            format!(
                "  {}  {}  ({})",
                item.id,
                item.title,
                item.updated_at.format("%Y-%m-%d %H:%M")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The wire name of a unit enum variant, e.g. `in_progress`
fn serde_label<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "?".to_string(),
    }
}
