//! Paginated, mergeable per-conversation message buffers.
//!
//! Each buffer is kept sorted ascending by `(createdAt, id)` with no
//! duplicate ids, whatever the interleaving of live windows and historical
//! pages.  At most `max_cached` conversations keep a buffer; the least
//! recently touched ones are evicted first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_shared::{ChatId, Message, MessageId};
use parley_store::{Cursor, Direction, Query, RemoteStore};
use serde_json::Value;
use tracing::{debug, info};

use crate::codec;
use crate::error::Result;

/// Merge two message sets by id.  Incoming copies replace existing ones.
pub fn merge(existing: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut by_id: HashMap<&MessageId, &Message> =
        HashMap::with_capacity(existing.len() + incoming.len());
    for m in existing.iter().chain(incoming) {
        by_id.insert(&m.id, m);
    }
    let mut merged: Vec<Message> = by_id.into_values().cloned().collect();
    merged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    merged
}

/// Outcome of a historical page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageResult {
    /// Messages returned by the store for this page.
    pub fetched: usize,
    /// Whether older messages may remain.
    pub has_more: bool,
}

struct ChatBuffer {
    messages: Vec<Message>,
    has_more: bool,
    loading_older: bool,
    touched: u64,
    generation: u64,
}

#[derive(Default)]
struct Buffers {
    chats: HashMap<ChatId, ChatBuffer>,
    tick: u64,
    next_generation: u64,
}

impl Buffers {
    fn entry(&mut self, chat: &ChatId) -> &mut ChatBuffer {
        self.tick += 1;
        let tick = self.tick;
        let next_generation = &mut self.next_generation;
        let buffer = self.chats.entry(chat.clone()).or_insert_with(|| {
            *next_generation += 1;
            ChatBuffer {
                messages: Vec::new(),
                has_more: true,
                loading_older: false,
                touched: tick,
                generation: *next_generation,
            }
        });
        buffer.touched = tick;
        buffer
    }
}

fn lock(buffers: &Mutex<Buffers>) -> MutexGuard<'_, Buffers> {
    buffers.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MessageStore {
    store: Arc<dyn RemoteStore>,
    page_size: usize,
    max_cached: usize,
    buffers: Mutex<Buffers>,
}

impl MessageStore {
    pub fn new(store: Arc<dyn RemoteStore>, page_size: usize, max_cached: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            max_cached: max_cached.max(1),
            buffers: Mutex::new(Buffers::default()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Query for the live window: the newest `page_size` messages.
    pub fn live_query(&self, chat: &ChatId) -> Query {
        Query::new(codec::messages_collection(chat))
            .order_by("createdAt", Direction::Descending)
            .limit(self.page_size)
    }

    /// Merge the live window into the buffer and return the full sequence.
    pub fn ingest_live(&self, chat: &ChatId, window: Vec<Message>) -> Vec<Message> {
        let short = window.len() < self.page_size;
        let mut buffers = lock(&self.buffers);
        let buffer = buffers.entry(chat);
        buffer.messages = merge(&buffer.messages, &window);
        if short {
            // The whole history fits in the window.
            buffer.has_more = false;
        }
        debug!(chat = %chat, window = window.len(), buffered = buffer.messages.len(), "live window merged");
        buffer.messages.clone()
    }

    /// Fetch the page strictly older than the oldest buffered message.
    ///
    /// A fetch already in flight for the same conversation, or an exhausted
    /// history, returns immediately without querying.
    pub async fn load_older(&self, chat: &ChatId) -> Result<PageResult> {
        let (generation, cursor) = {
            let mut buffers = lock(&self.buffers);
            let buffer = buffers.entry(chat);
            if buffer.loading_older || !buffer.has_more {
                return Ok(PageResult {
                    fetched: 0,
                    has_more: buffer.has_more,
                });
            }
            buffer.loading_older = true;
            let cursor = buffer.messages.first().map(|oldest| {
                Cursor::new(
                    Value::from(oldest.created_at.timestamp_millis()),
                    oldest.id.as_str(),
                )
            });
            (buffer.generation, cursor)
        };

        let collection = codec::messages_collection(chat);
        let mut query = Query::new(collection.clone())
            .order_by("createdAt", Direction::Descending)
            .limit(self.page_size);
        if let Some(cursor) = cursor {
            query = query.start_after(cursor);
        }

        let fetched = self.store.query(&query).await;

        let mut buffers = lock(&self.buffers);
        let Some(buffer) = buffers
            .chats
            .get_mut(chat)
            .filter(|b| b.generation == generation)
        else {
            debug!(chat = %chat, "discarding page for evicted buffer");
            return Ok(PageResult {
                fetched: 0,
                has_more: true,
            });
        };
        buffer.loading_older = false;

        let snapshot = fetched?;
        let page: Vec<Message> = codec::decode_all(&collection, snapshot.iter());
        let count = snapshot.len();
        buffer.messages = merge(&buffer.messages, &page);
        if count < self.page_size {
            buffer.has_more = false;
        }
        debug!(chat = %chat, fetched = count, has_more = buffer.has_more, "older page merged");

        Ok(PageResult {
            fetched: count,
            has_more: buffer.has_more,
        })
    }

    /// Buffered messages, ascending.  Empty for unknown conversations.
    pub fn messages(&self, chat: &ChatId) -> Vec<Message> {
        lock(&self.buffers)
            .chats
            .get(chat)
            .map(|b| b.messages.clone())
            .unwrap_or_default()
    }

    pub fn has_more(&self, chat: &ChatId) -> bool {
        lock(&self.buffers)
            .chats
            .get(chat)
            .map(|b| b.has_more)
            .unwrap_or(true)
    }

    pub fn is_loading(&self, chat: &ChatId) -> bool {
        lock(&self.buffers)
            .chats
            .get(chat)
            .is_some_and(|b| b.loading_older)
    }

    pub fn is_buffered(&self, chat: &ChatId) -> bool {
        lock(&self.buffers).chats.contains_key(chat)
    }

    pub fn buffered_count(&self) -> usize {
        lock(&self.buffers).chats.len()
    }

    /// Drop buffers, least recently touched first, until at most
    /// `max_cached` remain.  Conversations in `protected` are never evicted.
    pub fn evict_inactive(&self, protected: &[ChatId]) -> Vec<ChatId> {
        let mut buffers = lock(&self.buffers);
        let mut evicted = Vec::new();
        while buffers.chats.len() > self.max_cached {
            let victim = buffers
                .chats
                .iter()
                .filter(|(id, _)| !protected.contains(id))
                .min_by_key(|(_, b)| b.touched)
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else {
                break;
            };
            buffers.chats.remove(&victim);
            evicted.push(victim);
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted inactive message buffers");
        }
        evicted
    }

    pub fn clear(&self, chat: &ChatId) {
        lock(&self.buffers).chats.remove(chat);
    }

    pub fn clear_all(&self) {
        lock(&self.buffers).chats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, seed_history, TestStore};
    use std::time::Duration;

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    fn store_over(store: &TestStore, page: usize, max_cached: usize) -> MessageStore {
        MessageStore::new(Arc::new(store.clone()), page, max_cached)
    }

    #[test]
    fn test_merge_dedupes_and_orders() {
        let existing = vec![message("c", "b", "u", 2), message("c", "a", "u", 1)];
        let mut edited = message("c", "b", "u", 2);
        edited.content = "edited".into();
        let incoming = vec![edited, message("c", "c", "u", 2)];

        let merged = merge(&existing, &incoming);
        assert_eq!(ids(&merged), vec!["a", "b", "c"]);
        assert_eq!(merged[1].content, "edited");
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let store = TestStore::in_memory();
        let messages = store_over(&store, 3, 10);
        let chat = ChatId::from("c");
        let window = vec![message("c", "x", "u", 5), message("c", "y", "u", 6)];

        let once = messages.ingest_live(&chat, window.clone());
        let twice = messages.ingest_live(&chat, window);
        assert_eq!(once, twice);
        assert!(!messages.has_more(&chat));
    }

    #[test]
    fn test_live_window_keeps_older_history() {
        let store = TestStore::in_memory();
        let messages = store_over(&store, 2, 10);
        let chat = ChatId::from("c");

        messages.ingest_live(&chat, vec![message("c", "m1", "u", 1), message("c", "m2", "u", 2)]);
        let merged =
            messages.ingest_live(&chat, vec![message("c", "m2", "u", 2), message("c", "m3", "u", 3)]);
        assert_eq!(ids(&merged), vec!["m1", "m2", "m3"]);
        assert!(messages.has_more(&chat));
    }

    #[tokio::test]
    async fn test_pages_back_to_the_beginning() {
        let store = TestStore::in_memory();
        seed_history(&store, "c", "alice", 12).await;
        let messages = store_over(&store, 5, 10);
        let chat = ChatId::from("c");

        let live = store.query(&messages.live_query(&chat)).await.unwrap();
        let window: Vec<Message> = codec::decode_all("chats/c/messages", live.iter());
        let merged = messages.ingest_live(&chat, window);
        assert_eq!(ids(&merged), vec!["m008", "m009", "m010", "m011", "m012"]);

        let page = messages.load_older(&chat).await.unwrap();
        assert_eq!(page, PageResult { fetched: 5, has_more: true });
        let page = messages.load_older(&chat).await.unwrap();
        assert_eq!(page, PageResult { fetched: 2, has_more: false });

        let all = messages.messages(&chat);
        assert_eq!(all.len(), 12);
        assert_eq!(all.first().unwrap().id.as_str(), "m001");

        // Exhausted history does not query again.
        let queries = store.stats().queries;
        messages.load_older(&chat).await.unwrap();
        assert_eq!(store.stats().queries, queries);
    }

    #[tokio::test]
    async fn test_page_for_evicted_buffer_is_discarded() {
        let store = TestStore::in_memory();
        seed_history(&store, "c", "alice", 3).await;
        store.set_latency(Duration::from_millis(20));
        let messages = Arc::new(store_over(&store, 5, 10));
        let chat = ChatId::from("c");

        let loader = {
            let messages = messages.clone();
            let chat = chat.clone();
            tokio::spawn(async move { messages.load_older(&chat).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(messages.is_loading(&chat));
        messages.clear(&chat);

        let page = loader.await.unwrap().unwrap();
        assert_eq!(page.fetched, 0);
        assert!(messages.messages(&chat).is_empty());
    }

    #[test]
    fn test_eviction_is_lru_and_respects_protection() {
        let store = TestStore::in_memory();
        let messages = store_over(&store, 50, 2);
        for name in ["a", "b", "c"] {
            messages.ingest_live(&ChatId::from(name), vec![message(name, "m", "u", 1)]);
        }
        // Touch "a" so "b" becomes the oldest.
        messages.ingest_live(&ChatId::from("a"), Vec::new());

        let evicted = messages.evict_inactive(&[ChatId::from("b")]);
        assert_eq!(evicted, vec![ChatId::from("c")]);
        assert!(messages.is_buffered(&ChatId::from("b")));
        assert_eq!(messages.buffered_count(), 2);
    }
}
