//! Debounced per-conversation draft persistence

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Draft key used before the backend has assigned a conversation id
pub const NEW_CHAT_KEY: &str = "new_chat";

/// Quiet period before a draft is written
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Key for a conversation's draft
pub fn draft_key(conversation_id: Option<&str>) -> String {
    match conversation_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => NEW_CHAT_KEY.to_string(),
    }
}

/// Unsent compose-box content for one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub content: String,
    /// Milliseconds since the Unix epoch when the content was typed
    pub timestamp: i64,
}

/// Where drafts are persisted
///
/// The whole list is read and written at once, like a single local-storage
/// key holding every draft.
pub trait DraftBackend: Send + Sync {
    fn read_all(&self) -> io::Result<Vec<Draft>>;
    fn write_all(&self, drafts: &[Draft]) -> io::Result<()>;
}

/// In-process backend, mostly for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryDraftBackend {
    drafts: Mutex<Vec<Draft>>,
}

impl MemoryDraftBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DraftBackend for MemoryDraftBackend {
    fn read_all(&self) -> io::Result<Vec<Draft>> {
        Ok(self.drafts.lock().clone())
    }

    fn write_all(&self, drafts: &[Draft]) -> io::Result<()> {
        *self.drafts.lock() = drafts.to_vec();
        Ok(())
    }
}

/// Backend storing all drafts in one JSON file
#[derive(Debug, Clone)]
pub struct FileDraftBackend {
    path: PathBuf,
}

impl FileDraftBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DraftBackend for FileDraftBackend {
    fn read_all(&self) -> io::Result<Vec<Draft>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        if content.trim().is_empty() {
            return Ok(vec![]);
        }
        match serde_json::from_str(&content) {
            Ok(drafts) => Ok(drafts),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Ignoring unreadable drafts file: {}", e);
                Ok(vec![])
            }
        }
    }

    fn write_all(&self, drafts: &[Draft]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(drafts)?;
        std::fs::write(&self.path, content)
    }
}

struct PendingWrite {
    content: String,
    saved_at: i64,
    generation: u64,
    task: JoinHandle<()>,
}

struct DraftStoreInner {
    backend: Arc<dyn DraftBackend>,
    debounce: Duration,
    pending: Mutex<HashMap<String, PendingWrite>>,
    next_generation: Mutex<u64>,
    /// Held across every read-modify-write of the backend; taken before `pending`
    io: Mutex<()>,
}

/// Debounced draft store
///
/// Each `save` for a key cancels and reschedules that key's pending write, so
/// only the last content typed within the debounce window reaches the
/// backend. Keys are independent. Backend failures are logged and dropped.
#[derive(Clone)]
pub struct DraftStore {
    inner: Arc<DraftStoreInner>,
}

impl DraftStore {
    pub fn new(backend: Arc<dyn DraftBackend>) -> Self {
        Self::with_debounce(backend, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(backend: Arc<dyn DraftBackend>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(DraftStoreInner {
                backend,
                debounce,
                pending: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                io: Mutex::new(()),
            }),
        }
    }

    /// A store that keeps drafts in memory only
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDraftBackend::new()))
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Persisted draft content for `key`
    ///
    /// A write still inside its debounce window is not visible yet.
    pub fn load(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .into_iter()
            .find(|d| d.id == key)
            .map(|d| d.content)
    }

    /// All persisted drafts
    pub fn list(&self) -> Vec<Draft> {
        self.inner.read()
    }

    /// Schedule a write of `content` once typing goes quiet
    ///
    /// Must be called inside a tokio runtime. Whitespace-only content clears
    /// the draft right away.
    pub fn save(&self, key: &str, content: &str) {
        if content.trim().is_empty() {
            self.clear(key);
            return;
        }

        let generation = {
            let mut next = self.inner.next_generation.lock();
            *next += 1;
            *next
        };

        let mut pending = self.inner.pending.lock();
        let inner = Arc::clone(&self.inner);
        let task_key = key.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            inner.commit(&task_key, generation);
        });

        let previous = pending.insert(
            key.to_string(),
            PendingWrite {
                content: content.to_string(),
                saved_at: now_millis(),
                generation,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    /// Drop any pending write for `key` and remove its persisted draft
    pub fn clear(&self, key: &str) {
        let _io = self.inner.io.lock();
        if let Some(pending) = self.inner.pending.lock().remove(key) {
            pending.task.abort();
        }
        self.inner.remove_where(|d| d.id == key);
    }

    /// Clear `key` only for content typed at or before `before_ms`
    ///
    /// Content typed after that point (a newer draft) is kept.
    pub fn clear_stale(&self, key: &str, before_ms: i64) {
        let _io = self.inner.io.lock();
        {
            let mut pending = self.inner.pending.lock();
            if pending.get(key).is_some_and(|p| p.saved_at <= before_ms) {
                if let Some(stale) = pending.remove(key) {
                    stale.task.abort();
                }
            }
        }
        self.inner
            .remove_where(|d| d.id == key && d.timestamp <= before_ms);
    }

    /// Write every pending draft now
    pub fn flush(&self) {
        let _io = self.inner.io.lock();
        let pending: Vec<(String, PendingWrite)> = self.inner.pending.lock().drain().collect();
        for (key, write) in pending {
            write.task.abort();
            self.inner.persist(&key, write.content, write.saved_at);
        }
    }

    /// Whether any write is waiting for its debounce window
    pub fn has_pending(&self) -> bool {
        !self.inner.pending.lock().is_empty()
    }
}

impl DraftStoreInner {
    fn commit(&self, key: &str, generation: u64) {
        let _io = self.io.lock();
        let write = {
            let mut pending = self.pending.lock();
            match pending.get(key) {
                Some(p) if p.generation == generation => pending.remove(key),
                _ => None,
            }
        };
        if let Some(write) = write {
            self.persist(key, write.content, write.saved_at);
        }
    }

    fn read(&self) -> Vec<Draft> {
        match self.backend.read_all() {
            Ok(drafts) => drafts,
            Err(e) => {
                tracing::warn!("Failed to read drafts: {}", e);
                vec![]
            }
        }
    }

    /// Caller holds `io`
    fn persist(&self, key: &str, content: String, timestamp: i64) {
        let mut drafts = self.read();
        match drafts.iter_mut().find(|d| d.id == key) {
            Some(draft) => {
                draft.content = content;
                draft.timestamp = timestamp;
            }
            None => drafts.push(Draft {
                id: key.to_string(),
                content,
                timestamp,
            }),
        }
        if let Err(e) = self.backend.write_all(&drafts) {
            tracing::warn!(key, "Failed to save draft: {}", e);
        } else {
            tracing::debug!(key, "draft saved");
        }
    }

    /// Caller holds `io`
    fn remove_where(&self, predicate: impl Fn(&Draft) -> bool) {
        let mut drafts = self.read();
        let before = drafts.len();
        drafts.retain(|d| !predicate(d));
        if drafts.len() == before {
            return;
        }
        if let Err(e) = self.backend.write_all(&drafts) {
            tracing::warn!("Failed to remove draft: {}", e);
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
