//! One signed-in user's view of the messaging system.
//!
//! [`ChatSession`] wires the sync services together: it owns the
//! coordinator, caches and buffers for one identity and tears all of them
//! down in [`ChatSession::close`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_shared::{ChatId, Message, MessageId, UserId};
use parley_store::{Query, RemoteStore, Snapshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chat_list::{ChatListAggregator, ChatListUpdate};
use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::config::SyncConfig;
use crate::coordinator::{ScopeKey, ScopeKind, SubscriptionCoordinator, SubscriptionHandle};
use crate::error::Result;
use crate::message_store::{MessageStore, PageResult};
use crate::mutations::{Identity, MutationEngine, OutgoingMessage};
use crate::typing::{typing_users, DebounceTimings, TypingDebouncer, TypingSignal};
use crate::user_cache::UserCache;

/// The open conversation's messages after a change.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageWindowUpdate {
    pub chat_id: ChatId,
    /// Every buffered message, oldest first.
    pub messages: Vec<Message>,
    pub has_more: bool,
    /// Set when a message from someone else became the newest message
    /// since the previous delivery.
    pub incoming: Option<Message>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Messages(MessageWindowUpdate),
    /// Display names of the other users currently typing.
    Typing(Vec<String>),
}

type EventFn = Arc<dyn Fn(ChatEvent) + Send + Sync>;

#[derive(Default)]
struct ActiveChat {
    chat: Option<ChatId>,
    on_event: Option<EventFn>,
    debouncer: Option<TypingDebouncer>,
    eviction: Option<JoinHandle<()>>,
}

fn lock(active: &Mutex<ActiveChat>) -> MutexGuard<'_, ActiveChat> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ChatSession {
    identity: Identity,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    users: Arc<UserCache>,
    coordinator: Arc<SubscriptionCoordinator>,
    chat_list: ChatListAggregator,
    messages: Arc<MessageStore>,
    mutations: MutationEngine,
    typing: Arc<TypingSignal>,
    active: Mutex<ActiveChat>,
}

impl ChatSession {
    pub fn new(store: Arc<dyn RemoteStore>, identity: Identity, config: SyncConfig) -> Self {
        Self::with_clock(store, identity, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn RemoteStore>,
        identity: Identity,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let users = Arc::new(UserCache::new(
            store.clone(),
            config.user_cache_ttl,
            config.user_batch_size,
        ));
        let coordinator = Arc::new(SubscriptionCoordinator::new(store.clone()));
        let chat_list = ChatListAggregator::new(
            store.clone(),
            coordinator.clone(),
            users.clone(),
            config.chat_page_size,
        );
        let messages = Arc::new(MessageStore::new(
            store.clone(),
            config.message_page_size,
            config.max_cached_chats,
        ));
        let mutations = MutationEngine::new(store.clone(), clock.clone(), &config);
        let typing = Arc::new(TypingSignal::new(store, clock.clone()));

        info!(user = %identity.user_id, "chat session started");

        Self {
            identity,
            config,
            clock,
            users,
            coordinator,
            chat_list,
            messages,
            mutations,
            typing,
            active: Mutex::new(ActiveChat::default()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn users(&self) -> &UserCache {
        &self.users
    }

    pub fn coordinator(&self) -> &SubscriptionCoordinator {
        &self.coordinator
    }

    pub fn message_store(&self) -> &MessageStore {
        &self.messages
    }

    pub fn active_chat(&self) -> Option<ChatId> {
        lock(&self.active).chat.clone()
    }

    // -----------------------------------------------------------------------
    // Conversation list
    // -----------------------------------------------------------------------

    pub async fn watch_chats(
        &self,
        on_update: impl Fn(ChatListUpdate) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.chat_list.subscribe(&self.identity.user_id, on_update).await
    }

    pub async fn load_more_chats(&self) -> Result<bool> {
        self.chat_list.load_more().await
    }

    pub fn chat_list(&self) -> ChatListUpdate {
        self.chat_list.current()
    }

    /// The conversation with `other`, created on first use.
    pub async fn start_chat(&self, other: &UserId) -> Result<ChatId> {
        self.mutations
            .create_or_get_chat(&self.identity.user_id, other)
            .await
    }

    // -----------------------------------------------------------------------
    // Open conversation
    // -----------------------------------------------------------------------

    /// Make `chat` the open conversation.
    ///
    /// Replaces the message window and typing subscriptions of any
    /// previously open conversation, swaps the typing debouncer and
    /// schedules eviction of idle message buffers.
    pub async fn open_chat(
        &self,
        chat: &ChatId,
        on_event: impl Fn(ChatEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let on_event: EventFn = Arc::new(on_event);

        let previous = {
            let mut active = lock(&self.active);
            active.chat = Some(chat.clone());
            active.on_event = Some(on_event.clone());
            let keep = active.debouncer.as_ref().is_some_and(|d| d.chat() == chat);
            if keep {
                None
            } else {
                let next = TypingDebouncer::spawn(
                    self.typing.clone(),
                    chat.clone(),
                    self.identity.clone(),
                    DebounceTimings {
                        debounce: self.config.typing_debounce,
                        idle_clear: self.config.typing_idle_clear,
                    },
                );
                active.debouncer.replace(next)
            }
        };
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        let handle = self.subscribe_window(chat, on_event.clone()).await;
        self.subscribe_typing(chat, on_event).await;
        self.schedule_eviction(chat);

        debug!(chat = %chat, "conversation opened");
        handle
    }

    async fn subscribe_window(&self, chat: &ChatId, on_event: EventFn) -> SubscriptionHandle {
        let collection = codec::messages_collection(chat);
        let enrich = move |snapshot: Snapshot| {
            let collection = collection.clone();
            async move {
                let mut window: Vec<Message> = codec::decode_all(&collection, snapshot.iter());
                // The live query is newest first.
                window.reverse();
                window
            }
        };

        let messages = self.messages.clone();
        let chat_id = chat.clone();
        let me = self.identity.user_id.clone();
        let newest_seen: Mutex<Option<Option<MessageId>>> = Mutex::new(None);
        let deliver = move |window: Vec<Message>| {
            let newest = window.last().cloned();
            let merged = messages.ingest_live(&chat_id, window);

            let incoming = {
                let mut seen = newest_seen.lock().unwrap_or_else(PoisonError::into_inner);
                let newest_id = newest.as_ref().map(|m| m.id.clone());
                let first_delivery = seen.is_none();
                let changed = seen.as_ref() != Some(&newest_id);
                *seen = Some(newest_id);
                newest.filter(|m| !first_delivery && changed && m.sender_id != me)
            };

            on_event(ChatEvent::Messages(MessageWindowUpdate {
                chat_id: chat_id.clone(),
                messages: merged,
                has_more: messages.has_more(&chat_id),
                incoming,
            }));
        };

        self.coordinator
            .subscribe(
                ScopeKey::MessageWindow(chat.clone()),
                self.messages.live_query(chat),
                enrich,
                deliver,
            )
            .await
    }

    async fn subscribe_typing(&self, chat: &ChatId, on_event: EventFn) -> SubscriptionHandle {
        let clock = self.clock.clone();
        let me = self.identity.user_id.clone();
        let stale_after = self.config.typing_stale_after;
        let enrich = move |snapshot: Snapshot| {
            let names = typing_users(&snapshot, &me, clock.now(), stale_after);
            async move { names }
        };
        let deliver = move |names: Vec<String>| on_event(ChatEvent::Typing(names));

        self.coordinator
            .subscribe(
                ScopeKey::Typing(chat.clone()),
                Query::document(&codec::typing_path(chat)),
                enrich,
                deliver,
            )
            .await
    }

    fn schedule_eviction(&self, chat: &ChatId) {
        let messages = self.messages.clone();
        let protected = chat.clone();
        let grace = self.config.eviction_grace;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let evicted = messages.evict_inactive(&[protected]);
            if !evicted.is_empty() {
                debug!(evicted = ?evicted, "message buffers evicted");
            }
        });
        if let Some(previous) = lock(&self.active).eviction.replace(task) {
            previous.abort();
        }
    }

    /// Close the open conversation's subscriptions and typing signal.
    pub async fn close_chat(&self) {
        self.coordinator.close(ScopeKind::MessageWindow);
        self.coordinator.close(ScopeKind::Typing);
        let debouncer = {
            let mut active = lock(&self.active);
            active.chat = None;
            active.on_event = None;
            active.debouncer.take()
        };
        if let Some(debouncer) = debouncer {
            debouncer.shutdown().await;
        }
    }

    /// Fetch the next older page of the open conversation.
    pub async fn load_older(&self) -> Result<PageResult> {
        let (chat, on_event) = {
            let active = lock(&self.active);
            match &active.chat {
                Some(chat) => (chat.clone(), active.on_event.clone()),
                None => {
                    return Ok(PageResult {
                        fetched: 0,
                        has_more: false,
                    })
                }
            }
        };

        let page = self.messages.load_older(&chat).await?;
        if page.fetched > 0 {
            if let Some(on_event) = on_event {
                on_event(ChatEvent::Messages(MessageWindowUpdate {
                    chat_id: chat.clone(),
                    messages: self.messages.messages(&chat),
                    has_more: page.has_more,
                    incoming: None,
                }));
            }
        }
        Ok(page)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn send(&self, chat: &ChatId, outgoing: OutgoingMessage) -> Result<Message> {
        self.stop_typing();
        self.mutations.send(chat, &self.identity, outgoing).await
    }

    pub async fn edit(&self, chat: &ChatId, message: &MessageId, content: &str) -> Result<()> {
        self.mutations
            .edit(chat, message, &self.identity.user_id, content)
            .await
    }

    pub async fn delete(&self, chat: &ChatId, message: &MessageId) -> Result<()> {
        self.mutations
            .delete(chat, message, &self.identity.user_id)
            .await
    }

    pub async fn forward(&self, message: &Message, target: &ChatId) -> Result<Message> {
        self.mutations.forward(message, target, &self.identity).await
    }

    pub async fn mark_read(&self, chat: &ChatId) -> Result<usize> {
        self.mutations.mark_read(chat, &self.identity.user_id).await
    }

    // -----------------------------------------------------------------------
    // Typing
    // -----------------------------------------------------------------------

    pub fn keystroke(&self) {
        if let Some(debouncer) = &lock(&self.active).debouncer {
            debouncer.keystroke();
        }
    }

    pub fn stop_typing(&self) {
        if let Some(debouncer) = &lock(&self.active).debouncer {
            debouncer.stop();
        }
    }

    /// Tear everything down: subscriptions, timers, buffers and caches.
    pub async fn close(&self) {
        self.close_chat().await;
        self.chat_list.close();
        self.coordinator.close_all();
        if let Some(eviction) = lock(&self.active).eviction.take() {
            eviction.abort();
        }
        self.messages.clear_all();
        self.users.clear().await;
        info!(user = %self.identity.user_id, "chat session closed");
    }
}
