//! Configuration file support

use parley_session::UploadPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";

/// Configuration for parley
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the chat backend
    pub api_url: Option<String>,
    /// Default model id
    pub model: Option<String>,
    /// Default agent
    pub agent: Option<String>,
    /// Enable web search by default
    pub web_search: Option<bool>,
    /// Quiet period before a draft is saved, in milliseconds
    pub draft_debounce_ms: Option<u64>,
    /// Where drafts are stored
    pub drafts_path: Option<String>,
    /// Attachment limits
    pub uploads: UploadPolicy,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PARLEY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a file, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            api_url: Some(DEFAULT_API_URL.to_string()),
            web_search: Some(false),
            draft_debounce_ms: Some(300),
            ..Default::default()
        };
        default_config.save_to(&path)?;
        Ok(path)
    }

    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
    }

    pub fn draft_debounce(&self) -> Duration {
        self.draft_debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(parley_session::draft::DEFAULT_DEBOUNCE)
    }

    /// Drafts file, defaulting to the local data directory
    pub fn drafts_path(&self) -> PathBuf {
        match &self.drafts_path {
            Some(path) => PathBuf::from(path),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("parley")
                .join("drafts.json"),
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# parley configuration file
# Place at ~/.config/parley/config.toml (Linux), or point PARLEY_CONFIG_PATH at it

# Base URL of the chat backend
api_url = "http://localhost:8000/api"

# Default model id (see `parley --models`)
# model = "gpt-4-turbo"

# Default agent (optional)
# agent = "research"

# Enable web search for every message
web_search = false

# Quiet period before a draft is saved, in milliseconds
draft_debounce_ms = 300

# Where unsent drafts are kept (defaults to the local data directory)
# drafts_path = "~/.local/share/parley/drafts.json"

[uploads]
# Largest accepted attachment, in bytes
max_file_size = 10485760
accepted_extensions = ["png", "jpg", "jpeg", "gif", "webp", "pdf", "csv", "txt", "md", "json", "xlsx", "xls", "docx", "doc", "pptx"]
"#
}
