//! Conversation list updates pushed from finished streams

use parking_lot::Mutex;
use parley_api::ConversationItem;

/// Receives one upsert per completed reply
///
/// The session never refetches or replaces the list; it only reports the
/// conversation it just finished.
pub trait ConversationListCache: Send + Sync {
    fn upsert(&self, item: ConversationItem);
}

impl<F> ConversationListCache for F
where
    F: Fn(ConversationItem) + Send + Sync,
{
    fn upsert(&self, item: ConversationItem) {
        self(item)
    }
}

/// Most-recent-first conversation list held in memory
#[derive(Debug, Default)]
pub struct InMemoryConversationList {
    items: Mutex<Vec<ConversationItem>>,
}

impl InMemoryConversationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<ConversationItem> {
        self.items.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<ConversationItem> {
        self.items.lock().iter().find(|i| i.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl ConversationListCache for InMemoryConversationList {
    fn upsert(&self, item: ConversationItem) {
        let mut items = self.items.lock();
        let entry = match items.iter().position(|i| i.id == item.id) {
            Some(index) => {
                let mut existing = items.remove(index);
                existing.title = item.title;
                existing.updated_at = item.updated_at;
                existing
            }
            None => item,
        };
        tracing::debug!(conversation_id = %entry.id, "conversation list upsert");
        items.insert(0, entry);
    }
}
