//! End-to-end behaviour of the sync core against the in-memory store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parley_client::{
    codec, ChatSession, DeclineReason, Identity, ManualClock, MessageStore, OutgoingMessage,
    ScopeKey, ScopeKind, SyncConfig, SyncError, UserCache,
};
use parley_shared::{Chat, ChatId, Message, MessageId, MessageKind, UserId};
use parley_store::{DocPath, DocumentStore, MemoryBackend, Query, RemoteStore, Update};
use serde_json::json;

type Store = DocumentStore<MemoryBackend>;

fn remote(store: &Store) -> Arc<dyn RemoteStore> {
    Arc::new(store.clone())
}

async fn seed_user(store: &Store, id: &str, name: &str) {
    let fields = json!({
        "displayName": name,
        "email": format!("{id}@example.com"),
        "role": "employee",
        "createdAt": 0,
        "lastSeen": 0,
    });
    store
        .set_document(
            &DocPath::new("users", id),
            fields.as_object().unwrap().clone(),
            false,
        )
        .await
        .unwrap();
}

async fn seed_chat(store: &Store, a: &str, b: &str) -> ChatId {
    let (a, b) = (UserId::from(a), UserId::from(b));
    let id = ChatId::for_pair(&a, &b);
    let chat = Chat {
        id: id.clone(),
        participants: vec![a.clone(), b.clone()],
        created_at: Utc.timestamp_millis_opt(0).unwrap(),
        created_by: a.clone(),
        last_message_time: Utc.timestamp_millis_opt(0).unwrap(),
        unread_count: HashMap::from([(a, 0), (b, 0)]),
        last_message: None,
    };
    store
        .set_document(&codec::chat_path(&id), codec::encode(&chat).unwrap(), false)
        .await
        .unwrap();
    id
}

/// Seed `count` messages from `sender`, `m001` oldest, one second apart.
async fn seed_history(store: &Store, chat: &ChatId, sender: &str, count: usize) {
    for i in 1..=count {
        let message = Message {
            id: MessageId::from(format!("m{i:03}").as_str()),
            chat_id: chat.clone(),
            sender_id: UserId::from(sender),
            sender_name: sender.to_string(),
            content: format!("message {i}"),
            kind: MessageKind::Text,
            file_url: None,
            file_name: None,
            file_size: None,
            reply_to: None,
            forwarded_from: None,
            read_by: vec![UserId::from(sender)],
            created_at: Utc.timestamp_millis_opt(i as i64 * 1_000).unwrap(),
            updated_at: None,
            is_edited: false,
            is_deleted: false,
        };
        store
            .set_document(
                &codec::message_path(chat, &message.id),
                codec::encode(&message).unwrap(),
                false,
            )
            .await
            .unwrap();
    }
}

async fn load_chat(store: &Store, id: &ChatId) -> Chat {
    let doc = store
        .get_document(&codec::chat_path(id))
        .await
        .unwrap()
        .unwrap();
    codec::decode("chats", &doc).unwrap()
}

async fn load_messages(store: &Store, chat: &ChatId) -> Vec<Message> {
    let collection = codec::messages_collection(chat);
    let snapshot = store.query(&Query::new(collection.clone())).await.unwrap();
    codec::decode_all(&collection, snapshot.iter())
}

/// Prime a message store with the live window, as a subscription would.
async fn ingest_window(store: &Store, messages: &MessageStore, chat: &ChatId) -> Vec<Message> {
    let collection = codec::messages_collection(chat);
    let snapshot = store.query(&messages.live_query(chat)).await.unwrap();
    let mut window: Vec<Message> = codec::decode_all(&collection, snapshot.iter());
    window.reverse();
    messages.ingest_live(chat, window)
}

fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.as_str().to_string()).collect()
}

#[tokio::test]
async fn test_switching_conversations_keeps_one_listener_per_scope() {
    let store = Store::in_memory();
    let a = seed_chat(&store, "me", "ann").await;
    let b = seed_chat(&store, "me", "ben").await;
    let session = ChatSession::new(remote(&store), Identity::new("me", "Me"), SyncConfig::default());

    for chat in [&a, &b, &a] {
        session.open_chat(chat, |_| {}).await;
        assert_eq!(session.coordinator().active_count(), 2);
        assert_eq!(store.active_subscriptions(), 2);
    }

    assert_eq!(
        session.coordinator().active_key(ScopeKind::MessageWindow),
        Some(ScopeKey::MessageWindow(a.clone()))
    );
    assert_eq!(
        session.coordinator().active_key(ScopeKind::Typing),
        Some(ScopeKey::Typing(a))
    );

    session.close().await;
    assert_eq!(store.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_ingesting_the_same_window_twice_is_a_no_op() {
    let store = Store::in_memory();
    let chat = seed_chat(&store, "me", "ann").await;
    seed_history(&store, &chat, "ann", 12).await;
    let messages = MessageStore::new(remote(&store), 10, 8);

    let once = ingest_window(&store, &messages, &chat).await;
    let twice = ingest_window(&store, &messages, &chat).await;
    assert_eq!(once, twice);
    assert_eq!(messages.messages(&chat).len(), 10);
}

#[tokio::test]
async fn test_paging_backwards_reassembles_full_history() {
    let store = Store::in_memory();
    let chat = seed_chat(&store, "me", "ann").await;
    seed_history(&store, &chat, "ann", 37).await;
    let messages = MessageStore::new(remote(&store), 10, 8);

    ingest_window(&store, &messages, &chat).await;
    let mut calls = 0;
    while messages.has_more(&chat) {
        messages.load_older(&chat).await.unwrap();
        calls += 1;
        assert!(calls <= 4, "pagination did not terminate");
    }

    let mut expected = load_messages(&store, &chat).await;
    expected.sort_by(|x, y| (x.created_at, &x.id).cmp(&(y.created_at, &y.id)));
    assert_eq!(ids(&messages.messages(&chat)), ids(&expected));
    assert_eq!(calls, 3);
}

#[tokio::test]
async fn test_edit_window_and_ownership() {
    let store = Store::in_memory();
    let chat = seed_chat(&store, "ann", "ben").await;
    let t0 = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    let clock = Arc::new(ManualClock::new(t0));
    let ann = ChatSession::with_clock(
        remote(&store),
        Identity::new("ann", "Ann"),
        SyncConfig::default(),
        clock.clone(),
    );
    let ben = ChatSession::with_clock(
        remote(&store),
        Identity::new("ben", "Ben"),
        SyncConfig::default(),
        clock.clone(),
    );

    let sent = ann.send(&chat, OutgoingMessage::text("draft")).await.unwrap();

    clock.set(t0 + chrono::Duration::seconds(14 * 60 + 59));
    ann.edit(&chat, &sent.id, "final").await.unwrap();
    assert!(matches!(
        ben.delete(&chat, &sent.id).await,
        Err(SyncError::Declined(DeclineReason::NotSender))
    ));

    clock.set(t0 + chrono::Duration::seconds(15 * 60 + 1));
    assert!(matches!(
        ann.edit(&chat, &sent.id, "too late").await,
        Err(SyncError::Declined(DeclineReason::OutsideEditWindow))
    ));
    assert!(matches!(
        ann.delete(&chat, &sent.id).await,
        Err(SyncError::Declined(DeclineReason::OutsideEditWindow))
    ));

    let stored = load_messages(&store, &chat).await;
    assert_eq!(stored[0].content, "final");
    assert!(stored[0].is_edited);
    assert!(!stored[0].is_deleted);
}

#[tokio::test]
async fn test_send_updates_mirror_and_counters() {
    let store = Store::in_memory();
    let chat = seed_chat(&store, "ann", "ben").await;
    store
        .update_document(&codec::chat_path(&chat), Update::new().set("unreadCount.ben", 4))
        .await
        .unwrap();
    let ann = ChatSession::new(remote(&store), Identity::new("ann", "Ann"), SyncConfig::default());

    let sent = ann.send(&chat, OutgoingMessage::text("hello")).await.unwrap();

    let stored = load_chat(&store, &chat).await;
    assert_eq!(stored.last_message.as_ref().unwrap().id, sent.id);
    assert_eq!(stored.unread_for(&UserId::from("ben")), 5);
    assert_eq!(stored.unread_for(&UserId::from("ann")), 0);
    assert_eq!(
        stored.last_message_time.timestamp_millis(),
        sent.created_at.timestamp_millis()
    );
}

#[tokio::test]
async fn test_mark_read_clears_counter_and_stamps_messages() {
    let store = Store::in_memory();
    let chat = seed_chat(&store, "ann", "ben").await;
    let ann = ChatSession::new(remote(&store), Identity::new("ann", "Ann"), SyncConfig::default());
    let ben = ChatSession::new(remote(&store), Identity::new("ben", "Ben"), SyncConfig::default());

    for text in ["one", "two", "three"] {
        ben.send(&chat, OutgoingMessage::text(text)).await.unwrap();
    }
    assert_eq!(load_chat(&store, &chat).await.unread_for(&UserId::from("ann")), 3);

    assert_eq!(ann.mark_read(&chat).await.unwrap(), 3);

    let stored = load_chat(&store, &chat).await;
    let reader = UserId::from("ann");
    assert_eq!(stored.unread_for(&reader), 0);
    assert!(stored.last_message.unwrap().read_by.contains(&reader));
    for message in load_messages(&store, &chat).await {
        assert!(message.read_by.contains(&reader));
    }

    // Nothing left to mark: no writes at all.
    let writes = store.stats().writes;
    assert_eq!(ann.mark_read(&chat).await.unwrap(), 0);
    assert_eq!(store.stats().writes, writes);
}

#[tokio::test(start_paused = true)]
async fn test_user_cache_serves_stale_copy_within_ttl() {
    let store = Store::in_memory();
    seed_user(&store, "ann", "Ann").await;
    let cache = UserCache::new(remote(&store), Duration::from_secs(300), 10);
    let ann = UserId::from("ann");

    assert_eq!(cache.get_one(&ann).await.unwrap().display_name, "Ann");
    store
        .update_document(&DocPath::new("users", "ann"), Update::new().set("displayName", "Annie"))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(200)).await;
    assert_eq!(cache.get_one(&ann).await.unwrap().display_name, "Ann");

    tokio::time::advance(Duration::from_secs(101)).await;
    assert_eq!(cache.get_one(&ann).await.unwrap().display_name, "Annie");
}

#[tokio::test]
async fn test_concurrent_chat_creation_converges() {
    let store = Store::in_memory();
    seed_user(&store, "ann", "Ann").await;
    seed_user(&store, "ben", "Ben").await;
    store.set_latency(Duration::from_millis(15));

    let ann = ChatSession::new(remote(&store), Identity::new("ann", "Ann"), SyncConfig::default());
    let ben = ChatSession::new(remote(&store), Identity::new("ben", "Ben"), SyncConfig::default());

    let ben_id = UserId::from("ben");
    let ann_id = UserId::from("ann");
    let (first, second) = tokio::join!(
        ann.start_chat(&ben_id),
        ben.start_chat(&ann_id),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first, second);

    store.set_latency(Duration::ZERO);
    let chats = store
        .query(&Query::new("chats").array_contains("participants", "ann"))
        .await
        .unwrap();
    assert_eq!(chats.len(), 1);

    // Asking again finds the same conversation.
    assert_eq!(ann.start_chat(&UserId::from("ben")).await.unwrap(), first);
}

#[tokio::test]
async fn test_hundred_and_twenty_messages_page_in_two_steps() {
    let store = Store::in_memory();
    let chat = seed_chat(&store, "me", "ann").await;
    seed_history(&store, &chat, "ann", 120).await;
    let messages = MessageStore::new(remote(&store), 50, 8);

    let window = ingest_window(&store, &messages, &chat).await;
    assert_eq!(window.len(), 50);
    assert_eq!(window.first().unwrap().id.as_str(), "m071");
    assert_eq!(window.last().unwrap().id.as_str(), "m120");
    assert!(messages.has_more(&chat));

    let first = messages.load_older(&chat).await.unwrap();
    assert_eq!(first.fetched, 50);
    assert!(first.has_more);
    assert_eq!(messages.messages(&chat).first().unwrap().id.as_str(), "m021");

    let second = messages.load_older(&chat).await.unwrap();
    assert_eq!(second.fetched, 20);
    assert!(!second.has_more);

    let all = messages.messages(&chat);
    assert_eq!(all.len(), 120);
    assert_eq!(all.first().unwrap().id.as_str(), "m001");

    // Exhausted: further calls do not query.
    let queries = store.stats().queries;
    let third = messages.load_older(&chat).await.unwrap();
    assert_eq!(third.fetched, 0);
    assert_eq!(store.stats().queries, queries);
}
