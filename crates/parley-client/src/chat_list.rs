//! Conversation list for one user.
//!
//! Rows are built from the chat documents alone: the last message comes
//! from the denormalized mirror, and every participant of a page is
//! resolved through the [`UserCache`] in a single pass.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_shared::constants::CHATS_COLLECTION;
use parley_shared::{Chat, ChatId, MessageMirror, User, UserId};
use parley_store::{Cursor, Direction, Document, Query, RemoteStore, Snapshot};
use tracing::debug;

use crate::codec;
use crate::coordinator::{ScopeKey, ScopeKind, SubscriptionCoordinator, SubscriptionHandle};
use crate::error::Result;
use crate::user_cache::UserCache;

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatListEntry {
    pub chat: Chat,
    /// Visible participants, the current user included.
    pub participants: Vec<User>,
}

impl ChatListEntry {
    pub fn id(&self) -> &ChatId {
        &self.chat.id
    }

    pub fn counterpart(&self, me: &UserId) -> Option<&User> {
        self.participants.iter().find(|u| &u.id != me)
    }

    pub fn last_message(&self) -> Option<&MessageMirror> {
        self.chat.last_message.as_ref()
    }

    pub fn unread(&self, me: &UserId) -> i64 {
        self.chat.unread_for(me)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatListUpdate {
    /// Newest `lastMessageTime` first.
    pub entries: Vec<ChatListEntry>,
    pub has_more: bool,
}

/// Caller-side narrowing of the list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatListFilter {
    /// Case-insensitive match on counterpart name or email, or on the last
    /// message text.  Blank matches everything.
    pub search: String,
    pub unread_only: bool,
}

impl ChatListFilter {
    pub fn matches(&self, entry: &ChatListEntry, me: &UserId) -> bool {
        if self.unread_only && entry.unread(me) <= 0 {
            return false;
        }
        let needle = self.search.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        let counterpart_hit = entry.counterpart(me).is_some_and(|u| {
            u.display_name.to_lowercase().contains(&needle)
                || u.email.to_lowercase().contains(&needle)
        });
        let message_hit = entry
            .last_message()
            .is_some_and(|m| m.display_content().to_lowercase().contains(&needle));
        counterpart_hit || message_hit
    }

    pub fn apply<'a>(&self, entries: &'a [ChatListEntry], me: &UserId) -> Vec<&'a ChatListEntry> {
        entries.iter().filter(|e| self.matches(e, me)).collect()
    }
}

/// A page of raw chat documents after enrichment.
struct Page {
    entries: Vec<ChatListEntry>,
    raw_len: usize,
    tail: Option<Cursor>,
}

/// Decode a page of chats and attach participant profiles.
///
/// Chats whose counterpart is missing, deleted or inactive are dropped.
async fn build_page(users: &UserCache, me: &UserId, docs: &[Document]) -> Page {
    let chats: Vec<Chat> = codec::decode_all(CHATS_COLLECTION, docs);
    let ids: BTreeSet<&UserId> = chats.iter().flat_map(|c| c.participants.iter()).collect();
    let profiles = users.get(ids).await;

    let mut entries = Vec::with_capacity(chats.len());
    for chat in chats {
        let participants: Vec<User> = chat
            .participants
            .iter()
            .filter_map(|id| profiles.get(id))
            .filter(|u| u.is_visible())
            .cloned()
            .collect();
        if !participants.iter().any(|u| &u.id != me) {
            debug!(chat = %chat.id, "skipping chat without a visible counterpart");
            continue;
        }
        entries.push(ChatListEntry { chat, participants });
    }

    Page {
        entries,
        raw_len: docs.len(),
        tail: docs.last().map(|d| Cursor::at(d, "lastMessageTime")),
    }
}

/// Whether `entry` comes strictly after `cursor` in newest-first order.
fn sorts_after(entry: &ChatListEntry, cursor: &Cursor) -> bool {
    let Some(at) = cursor.value.as_i64() else {
        return false;
    };
    let key = (entry.chat.last_message_time.timestamp_millis(), entry.chat.id.as_str());
    key < (at, cursor.id.as_str())
}

type UpdateFn = Arc<dyn Fn(ChatListUpdate) + Send + Sync>;

#[derive(Default)]
struct ListState {
    user: Option<UserId>,
    generation: u64,
    live: Vec<ChatListEntry>,
    older: Vec<ChatListEntry>,
    /// Position after the last raw document fetched so far.
    tail: Option<Cursor>,
    has_more: bool,
    loading_more: bool,
    on_update: Option<UpdateFn>,
}

impl ListState {
    fn combined(&self) -> ChatListUpdate {
        let mut by_id: HashMap<&ChatId, &ChatListEntry> = HashMap::new();
        for entry in self.older.iter().chain(&self.live) {
            by_id.insert(&entry.chat.id, entry);
        }
        let mut entries: Vec<ChatListEntry> = by_id.into_values().cloned().collect();
        entries.sort_by(|a, b| {
            b.chat
                .last_message_time
                .cmp(&a.chat.last_message_time)
                .then_with(|| b.chat.id.cmp(&a.chat.id))
        });
        ChatListUpdate {
            entries,
            has_more: self.has_more,
        }
    }
}

fn lock(state: &Mutex<ListState>) -> MutexGuard<'_, ListState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn notify(state: &Mutex<ListState>) {
    let (update, callback) = {
        let state = lock(state);
        (state.combined(), state.on_update.clone())
    };
    if let Some(callback) = callback {
        callback(update);
    }
}

pub struct ChatListAggregator {
    store: Arc<dyn RemoteStore>,
    coordinator: Arc<SubscriptionCoordinator>,
    users: Arc<UserCache>,
    page_size: usize,
    state: Arc<Mutex<ListState>>,
}

impl ChatListAggregator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        coordinator: Arc<SubscriptionCoordinator>,
        users: Arc<UserCache>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            coordinator,
            users,
            page_size: page_size.max(1),
            state: Arc::new(Mutex::new(ListState::default())),
        }
    }

    fn page_query(&self, user: &UserId) -> Query {
        Query::new(CHATS_COLLECTION)
            .array_contains("participants", user.as_str())
            .order_by("lastMessageTime", Direction::Descending)
            .limit(self.page_size)
    }

    /// Stream the conversation list of `user` to `on_update`.
    pub async fn subscribe(
        &self,
        user: &UserId,
        on_update: impl Fn(ChatListUpdate) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let generation = {
            let mut state = lock(&self.state);
            if state.user.as_ref() != Some(user) {
                *state = ListState {
                    user: Some(user.clone()),
                    generation: state.generation + 1,
                    has_more: true,
                    ..ListState::default()
                };
            }
            let callback: UpdateFn = Arc::new(on_update);
            state.on_update = Some(callback);
            state.generation
        };

        let users = self.users.clone();
        let me = user.clone();
        let enrich = move |snapshot: Snapshot| {
            let users = users.clone();
            let me = me.clone();
            async move { build_page(&users, &me, &snapshot.docs).await }
        };

        let state = self.state.clone();
        let page_size = self.page_size;
        let deliver = move |page: Page| {
            {
                let mut state = lock(&state);
                if state.generation != generation {
                    return;
                }
                let previous = std::mem::replace(&mut state.live, page.entries);
                if state.older.is_empty() {
                    state.tail = page.tail;
                    state.has_more = page.raw_len == page_size;
                } else if let (Some(live_end), Some(loaded_end)) =
                    (page.tail.as_ref(), state.tail.clone())
                {
                    // Chats pushed below the live page by newer ones are
                    // still inside the loaded range.
                    let live_ids: HashSet<ChatId> =
                        state.live.iter().map(|e| e.chat.id.clone()).collect();
                    let pushed: Vec<ChatListEntry> = previous
                        .into_iter()
                        .filter(|e| !live_ids.contains(&e.chat.id))
                        .filter(|e| sorts_after(e, live_end) && !sorts_after(e, &loaded_end))
                        .collect();
                    if !pushed.is_empty() {
                        let pushed_ids: HashSet<&ChatId> =
                            pushed.iter().map(|e| &e.chat.id).collect();
                        state.older.retain(|e| !pushed_ids.contains(&e.chat.id));
                        state.older.extend(pushed);
                    }
                }
            }
            notify(&state);
        };

        self.coordinator
            .subscribe(ScopeKey::ChatList(user.clone()), self.page_query(user), enrich, deliver)
            .await
    }

    /// Fetch the next page after the last conversation seen so far.
    ///
    /// Returns whether more conversations may remain.
    pub async fn load_more(&self) -> Result<bool> {
        let (user, generation, tail) = {
            let mut state = lock(&self.state);
            let Some(user) = state.user.clone() else {
                return Ok(false);
            };
            if !state.has_more || state.loading_more {
                return Ok(state.has_more);
            }
            state.loading_more = true;
            (user, state.generation, state.tail.clone())
        };

        let mut query = self.page_query(&user);
        if let Some(tail) = tail {
            query = query.start_after(tail);
        }
        let fetched = self.store.query(&query).await;

        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let mut state = lock(&self.state);
                if state.generation == generation {
                    state.loading_more = false;
                }
                return Err(e.into());
            }
        };
        let page = build_page(&self.users, &user, &snapshot.docs).await;

        let has_more = {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return Ok(false);
            }
            state.loading_more = false;
            state.older.extend(page.entries);
            if page.tail.is_some() {
                state.tail = page.tail;
            }
            state.has_more = page.raw_len == self.page_size;
            state.has_more
        };
        debug!(user = %user, fetched = page.raw_len, has_more, "chat list page loaded");
        notify(&self.state);
        Ok(has_more)
    }

    /// The list as last delivered.
    pub fn current(&self) -> ChatListUpdate {
        lock(&self.state).combined()
    }

    /// Stop the live list and forget its pages.
    pub fn close(&self) {
        self.coordinator.close(ScopeKind::ChatList);
        let mut state = lock(&self.state);
        *state = ListState {
            generation: state.generation + 1,
            ..ListState::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, seed_chat, seed_user, TestStore};
    use parley_store::{DocPath, Update};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        store: TestStore,
        aggregator: ChatListAggregator,
    }

    fn fixture(page_size: usize) -> Fixture {
        let store = TestStore::in_memory();
        let remote: Arc<dyn RemoteStore> = Arc::new(store.clone());
        let coordinator = Arc::new(SubscriptionCoordinator::new(remote.clone()));
        let users = Arc::new(UserCache::new(remote.clone(), Duration::from_secs(300), 10));
        let aggregator = ChatListAggregator::new(remote, coordinator, users, page_size);
        Fixture { store, aggregator }
    }

    async fn subscribe(
        fixture: &Fixture,
        user: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<ChatListUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = fixture
            .aggregator
            .subscribe(&UserId::from(user), move |update| {
                let _ = tx.send(update);
            })
            .await;
        (handle, rx)
    }

    fn ids(update: &ChatListUpdate) -> Vec<&str> {
        update.entries.iter().map(|e| e.chat.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_rows_use_mirror_and_one_lookup_per_user() {
        let f = fixture(20);
        for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
            seed_user(&f.store, id, name).await;
        }
        let last = message("alice_bob", "m1", "bob", 50);
        seed_chat(&f.store, "alice", "bob", 50, Some(&last)).await;
        seed_chat(&f.store, "alice", "carol", 80, None).await;
        let before = f.store.stats();

        let (_handle, mut rx) = subscribe(&f, "alice").await;
        let update = rx.recv().await.unwrap();

        assert_eq!(ids(&update), vec!["alice_carol", "alice_bob"]);
        assert!(!update.has_more);
        let bob_row = &update.entries[1];
        assert_eq!(bob_row.counterpart(&UserId::from("alice")).unwrap().display_name, "Bob");
        assert_eq!(bob_row.last_message().unwrap().id.as_str(), "m1");

        let after = f.store.stats();
        assert_eq!(after.gets - before.gets, 3);
        assert_eq!(after.queries, before.queries);
    }

    #[tokio::test]
    async fn test_chat_with_inactive_counterpart_is_skipped() {
        let f = fixture(20);
        seed_user(&f.store, "alice", "Alice").await;
        seed_user(&f.store, "bob", "Bob").await;
        seed_user(&f.store, "dave", "Dave").await;
        f.store
            .update_document(&DocPath::new("users", "dave"), Update::new().set("isActive", false))
            .await
            .unwrap();
        seed_chat(&f.store, "alice", "bob", 1, None).await;
        seed_chat(&f.store, "alice", "dave", 2, None).await;
        seed_chat(&f.store, "alice", "ghost", 3, None).await;

        let (_handle, mut rx) = subscribe(&f, "alice").await;
        let update = rx.recv().await.unwrap();
        assert_eq!(ids(&update), vec!["alice_bob"]);
    }

    #[tokio::test]
    async fn test_load_more_appends_next_page() {
        let f = fixture(2);
        seed_user(&f.store, "alice", "Alice").await;
        for (i, peer) in ["p1", "p2", "p3", "p4", "p5"].iter().enumerate() {
            seed_user(&f.store, peer, peer).await;
            seed_chat(&f.store, "alice", peer, i as i64 + 1, None).await;
        }

        let (_handle, mut rx) = subscribe(&f, "alice").await;
        let first = rx.recv().await.unwrap();
        assert_eq!(ids(&first), vec!["alice_p5", "alice_p4"]);
        assert!(first.has_more);

        assert!(f.aggregator.load_more().await.unwrap());
        let second = rx.recv().await.unwrap();
        assert_eq!(ids(&second), vec!["alice_p5", "alice_p4", "alice_p3", "alice_p2"]);

        assert!(!f.aggregator.load_more().await.unwrap());
        let third = rx.recv().await.unwrap();
        assert_eq!(third.entries.len(), 5);
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn test_new_chat_after_load_more_keeps_pushed_down_chat() {
        let f = fixture(2);
        seed_user(&f.store, "alice", "Alice").await;
        for (i, peer) in ["p1", "p2", "p3", "p4", "p5", "p6"].iter().enumerate() {
            seed_user(&f.store, peer, peer).await;
            if *peer != "p6" {
                seed_chat(&f.store, "alice", peer, i as i64 + 1, None).await;
            }
        }

        let (_handle, mut rx) = subscribe(&f, "alice").await;
        rx.recv().await.unwrap();
        f.aggregator.load_more().await.unwrap();
        let loaded = rx.recv().await.unwrap();
        assert_eq!(ids(&loaded), vec!["alice_p5", "alice_p4", "alice_p3", "alice_p2"]);

        seed_chat(&f.store, "alice", "p6", 6, None).await;
        let update = rx.recv().await.unwrap();
        assert_eq!(
            ids(&update),
            vec!["alice_p6", "alice_p5", "alice_p4", "alice_p3", "alice_p2"]
        );
        assert!(update.has_more);

        // A chat removed from inside the live page is not brought back.
        f.store
            .delete_document(&DocPath::new("chats", "alice_p5"))
            .await
            .unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(ids(&update), vec!["alice_p6", "alice_p4", "alice_p3", "alice_p2"]);
    }

    #[tokio::test]
    async fn test_live_update_moves_chat_to_top() {
        let f = fixture(20);
        for id in ["alice", "bob", "carol"] {
            seed_user(&f.store, id, id).await;
        }
        seed_chat(&f.store, "alice", "bob", 1, None).await;
        seed_chat(&f.store, "alice", "carol", 2, None).await;

        let (_handle, mut rx) = subscribe(&f, "alice").await;
        assert_eq!(ids(&rx.recv().await.unwrap()), vec!["alice_carol", "alice_bob"]);

        f.store
            .update_document(
                &DocPath::new("chats", "alice_bob"),
                Update::new().set("lastMessageTime", 10),
            )
            .await
            .unwrap();
        assert_eq!(ids(&rx.recv().await.unwrap()), vec!["alice_bob", "alice_carol"]);
    }

    fn entry(counterpart: &str, email: &str, unread: i64, last: Option<&str>) -> ChatListEntry {
        let user = |id: &str, email: &str| User {
            id: UserId::from(id),
            display_name: id.to_string(),
            email: email.to_string(),
            role: parley_shared::Role::Employee,
            photo_url: None,
            is_online: false,
            is_active: true,
            is_deleted: false,
            created_at: chrono::Utc::now(),
            last_seen: chrono::Utc::now(),
        };
        let chat = Chat {
            id: ChatId::for_pair(&UserId::from("me"), &UserId::from(counterpart)),
            participants: vec![UserId::from("me"), UserId::from(counterpart)],
            created_at: chrono::Utc::now(),
            created_by: UserId::from("me"),
            last_message_time: chrono::Utc::now(),
            unread_count: HashMap::from([(UserId::from("me"), unread)]),
            last_message: last.map(|text| {
                let mut m = message("c", "m", counterpart, 0);
                m.content = text.to_string();
                MessageMirror::from(&m)
            }),
        };
        ChatListEntry {
            chat,
            participants: vec![user("me", "me@example.com"), user(counterpart, email)],
        }
    }

    #[test]
    fn test_filter_search_and_unread() {
        let me = UserId::from("me");
        let entries = vec![
            entry("Bob", "bob@corp.io", 0, Some("lunch tomorrow?")),
            entry("Carol", "carol@corp.io", 2, None),
        ];

        let by_name = ChatListFilter {
            search: "  bOB ".into(),
            unread_only: false,
        };
        assert_eq!(by_name.apply(&entries, &me).len(), 1);

        let by_message = ChatListFilter {
            search: "LUNCH".into(),
            unread_only: false,
        };
        assert_eq!(by_message.apply(&entries, &me)[0].chat.participants[1].as_str(), "Bob");

        let by_email = ChatListFilter {
            search: "corp.io".into(),
            unread_only: true,
        };
        let hits = by_email.apply(&entries, &me);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].unread(&me), 2);

        // The current user's own name never matches.
        let self_match = ChatListFilter {
            search: "me@example".into(),
            unread_only: false,
        };
        assert!(self_match.apply(&entries, &me).is_empty());
    }
}
