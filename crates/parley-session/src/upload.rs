//! Attachment validation and concurrent upload tracking

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use parley_api::{ChatClient, UploadedFile};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

use crate::draft::NEW_CHAT_KEY;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10 MiB
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];
pub const ACCEPTED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "pdf", "csv", "txt", "md", "json", "xlsx", "xls", "docx",
    "doc", "pptx",
];

/// A file picked by the user, held in memory
#[derive(Debug, Clone)]
pub struct AttachedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Arc<[u8]>,
}

impl AttachedFile {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Build a file, guessing the MIME type from the extension
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let name = name.into();
        let mime_type = guess_mime_type(extension_of(&name).as_deref()).to_string();
        Self::new(name, mime_type, bytes)
    }

    /// Read a file from disk
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::from_bytes(name, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Lowercased extension, if the name has one
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
            || self
                .extension()
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
    }

    /// `data:` URL of the file contents, used as an image preview
    pub fn data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

fn guess_mime_type(extension: Option<&str>) -> &'static str {
    match extension {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("json") => "application/json",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("xls") => "application/vnd.ms-excel",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("doc") => "application/msword",
        Some("pptx") => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

/// Why a file was refused before upload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadRejection {
    #[error("File is empty")]
    Empty,
    #[error("File is too large ({size} bytes, limit is {max} bytes)")]
    TooLarge { size: u64, max: u64 },
    #[error("Unsupported file type: .{0}")]
    UnsupportedType(String),
    #[error("File has no extension")]
    NoExtension,
}

/// Which files may be attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    /// Maximum size of a single file in bytes
    pub max_file_size: u64,
    /// Accepted extensions, lowercase without the dot
    pub accepted_extensions: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            accepted_extensions: ACCEPTED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl UploadPolicy {
    pub fn validate(&self, file: &AttachedFile) -> Result<(), UploadRejection> {
        let size = file.size();
        if size == 0 {
            return Err(UploadRejection::Empty);
        }
        if size > self.max_file_size {
            return Err(UploadRejection::TooLarge {
                size,
                max: self.max_file_size,
            });
        }

        let ext = file.extension().ok_or(UploadRejection::NoExtension)?;
        if !self.accepted_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)) {
            return Err(UploadRejection::UnsupportedType(ext));
        }
        Ok(())
    }
}

/// Where a file is in its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Validating,
    Uploading,
    Ready,
    Error,
}

impl FileStatus {
    /// No more work will happen for this file
    pub fn is_settled(&self) -> bool {
        matches!(self, FileStatus::Ready | FileStatus::Error)
    }
}

/// A tracked attachment and its current state
#[derive(Debug, Clone)]
pub struct FileWithStatus {
    pub id: String,
    pub file: AttachedFile,
    pub status: FileStatus,
    /// User-facing reason when `status` is `Error`
    pub error: Option<String>,
    /// Data URL for image files
    pub preview: Option<String>,
    /// Backend reference once `status` is `Ready`
    pub uploaded: Option<UploadedFile>,
}

/// Changes broadcast by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    StatusChanged {
        id: String,
        status: FileStatus,
        error: Option<String>,
    },
    Removed {
        id: String,
    },
}

/// Sends a validated file to the backend
#[async_trait]
pub trait FileUploader: Send + Sync {
    async fn upload(
        &self,
        file: &AttachedFile,
        conversation_key: &str,
    ) -> parley_api::Result<UploadedFile>;
}

#[async_trait]
impl FileUploader for ChatClient {
    async fn upload(
        &self,
        file: &AttachedFile,
        conversation_key: &str,
    ) -> parley_api::Result<UploadedFile> {
        self.upload_file(&file.name, &file.mime_type, file.bytes.to_vec(), conversation_key)
            .await
    }
}

struct Tracked {
    entry: FileWithStatus,
    cancel: CancellationToken,
}

struct CoordinatorInner {
    uploader: Arc<dyn FileUploader>,
    policy: UploadPolicy,
    files: Mutex<Vec<Tracked>>,
    conversation_key: Mutex<String>,
    event_tx: broadcast::Sender<UploadEvent>,
    settled: Notify,
}

/// Validates and uploads attachments, each on its own task
///
/// Files never wait on each other: one failing or being removed leaves the
/// rest untouched.
#[derive(Clone)]
pub struct FileUploadCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FileUploadCoordinator {
    pub fn new(uploader: Arc<dyn FileUploader>, policy: UploadPolicy) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(CoordinatorInner {
                uploader,
                policy,
                files: Mutex::new(Vec::new()),
                conversation_key: Mutex::new(NEW_CHAT_KEY.to_string()),
                event_tx,
                settled: Notify::new(),
            }),
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.inner.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Conversation that new uploads are filed under
    pub fn set_conversation_key(&self, key: impl Into<String>) {
        *self.inner.conversation_key.lock() = key.into();
    }

    /// Start tracking `files`, returning their ids in order
    pub fn add_files(&self, files: Vec<AttachedFile>) -> Vec<String> {
        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let id = uuid::Uuid::new_v4().to_string();
            let cancel = CancellationToken::new();
            self.inner.files.lock().push(Tracked {
                entry: FileWithStatus {
                    id: id.clone(),
                    file: file.clone(),
                    status: FileStatus::Validating,
                    error: None,
                    preview: None,
                    uploaded: None,
                },
                cancel: cancel.clone(),
            });
            let _ = self.inner.event_tx.send(UploadEvent::StatusChanged {
                id: id.clone(),
                status: FileStatus::Validating,
                error: None,
            });
            tracing::debug!(file_id = %id, name = %file.name, "file added");

            tokio::spawn(run_pipeline(Arc::clone(&self.inner), id.clone(), file, cancel));
            ids.push(id);
        }
        ids
    }

    /// Stop tracking a file, cancelling its upload if still running
    pub fn remove_file(&self, id: &str) -> bool {
        let removed = {
            let mut files = self.inner.files.lock();
            files
                .iter()
                .position(|t| t.entry.id == id)
                .map(|index| files.remove(index))
        };
        let Some(tracked) = removed else {
            return false;
        };
        tracked.cancel.cancel();
        let _ = self.inner.event_tx.send(UploadEvent::Removed { id: id.to_string() });
        self.inner.notify_if_settled();
        true
    }

    /// Current state of every tracked file
    pub fn files(&self) -> Vec<FileWithStatus> {
        self.inner.files.lock().iter().map(|t| t.entry.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<FileWithStatus> {
        self.inner
            .files
            .lock()
            .iter()
            .find(|t| t.entry.id == id)
            .map(|t| t.entry.clone())
    }

    /// Files ready to go out with the next message
    pub fn snapshot(&self) -> Vec<FileWithStatus> {
        self.inner
            .files
            .lock()
            .iter()
            .filter(|t| t.entry.status == FileStatus::Ready)
            .map(|t| t.entry.clone())
            .collect()
    }

    /// Drop files that were sent; anything added since stays
    pub fn discard(&self, ids: &[String]) {
        let mut files = self.inner.files.lock();
        files.retain(|t| {
            let sent = ids.contains(&t.entry.id);
            if sent {
                t.cancel.cancel();
            }
            !sent
        });
    }

    /// Drop every file
    pub fn clear(&self) {
        let drained: Vec<Tracked> = self.inner.files.lock().drain(..).collect();
        for tracked in drained {
            tracked.cancel.cancel();
        }
        self.inner.notify_if_settled();
    }

    pub fn is_settled(&self) -> bool {
        self.inner.is_settled()
    }

    /// Wait until no file is validating or uploading
    pub async fn wait_settled(&self) {
        loop {
            let notified = self.inner.settled.notified();
            if self.is_settled() {
                return;
            }
            notified.await;
        }
    }
}

impl CoordinatorInner {
    /// Apply `f` to a tracked file; a removed file is left alone
    fn update(&self, id: &str, f: impl FnOnce(&mut FileWithStatus)) -> bool {
        let event = {
            let mut files = self.files.lock();
            let Some(tracked) = files.iter_mut().find(|t| t.entry.id == id) else {
                return false;
            };
            f(&mut tracked.entry);
            UploadEvent::StatusChanged {
                id: id.to_string(),
                status: tracked.entry.status,
                error: tracked.entry.error.clone(),
            }
        };
        let _ = self.event_tx.send(event);
        self.notify_if_settled();
        true
    }

    fn is_settled(&self) -> bool {
        self.files.lock().iter().all(|t| t.entry.status.is_settled())
    }

    fn notify_if_settled(&self) {
        if self.is_settled() {
            self.settled.notify_waiters();
        }
    }
}

async fn run_pipeline(
    inner: Arc<CoordinatorInner>,
    id: String,
    file: AttachedFile,
    cancel: CancellationToken,
) {
    if let Err(rejection) = inner.policy.validate(&file) {
        tracing::debug!(file_id = %id, "file rejected: {}", rejection);
        inner.update(&id, |entry| {
            entry.status = FileStatus::Error;
            entry.error = Some(rejection.to_string());
        });
        return;
    }

    let preview = file.is_image().then(|| file.data_url());
    let still_tracked = inner.update(&id, |entry| {
        entry.status = FileStatus::Uploading;
        entry.preview = preview;
    });
    if !still_tracked {
        return;
    }

    let key = inner.conversation_key.lock().clone();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(file_id = %id, "upload cancelled");
            return;
        }
        result = inner.uploader.upload(&file, &key) => result,
    };

    match result {
        Ok(uploaded) => {
            inner.update(&id, |entry| {
                entry.status = FileStatus::Ready;
                entry.uploaded = Some(uploaded);
            });
        }
        Err(e) => {
            let error = crate::Error::Upload(e.to_string());
            tracing::warn!(file_id = %id, name = %file.name, "{}", error);
            inner.update(&id, |entry| {
                entry.status = FileStatus::Error;
                entry.error = Some(error.to_string());
            });
        }
    }
}
