//! Outgoing chat stream request and its schema check

use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::error::{Error, Result};

/// Upper bound on a single outgoing message, in characters
pub const MAX_MESSAGE_CHARS: usize = 32_000;

/// Body for `POST /chat/stream`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatStreamRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Ids of files uploaded for this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

static REQUEST_VALIDATOR: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
    let schema = serde_json::json!({
        "type": "object",
        "required": ["message"],
        "additionalProperties": false,
        "properties": {
            "message": {
                "type": "string",
                "minLength": 1,
                "maxLength": MAX_MESSAGE_CHARS,
                "pattern": "\\S"
            },
            "agent": { "type": "string", "minLength": 1 },
            "model": { "type": "string", "minLength": 1 },
            "web_search": { "type": "boolean" },
            "conversation_id": { "type": "string", "minLength": 1 },
            "attachments": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 }
            }
        }
    });
    jsonschema::validator_for(&schema).expect("chat request schema is valid")
});

impl ChatStreamRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Check the body against the request schema before anything is sent
    pub fn validate(&self) -> Result<()> {
        let instance = serde_json::to_value(self)?;
        let errors: Vec<String> = REQUEST_VALIDATOR
            .iter_errors(&instance)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidRequest(errors.join("; ")))
        }
    }
}
