//! Fixtures shared by the unit tests.

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use parley_shared::{Chat, ChatId, Message, MessageId, MessageKind, MessageMirror, UserId};
use parley_store::{DocPath, DocumentStore, MemoryBackend, RemoteStore};
use serde_json::json;

use crate::codec;

pub type TestStore = DocumentStore<MemoryBackend>;

pub fn message(chat: &str, id: &str, sender: &str, created_ms: i64) -> Message {
    Message {
        id: MessageId::from(id),
        chat_id: ChatId::from(chat),
        sender_id: UserId::from(sender),
        sender_name: sender.to_string(),
        content: format!("message {id}"),
        kind: MessageKind::Text,
        file_url: None,
        file_name: None,
        file_size: None,
        reply_to: None,
        forwarded_from: None,
        read_by: vec![UserId::from(sender)],
        created_at: Utc.timestamp_millis_opt(created_ms).unwrap(),
        updated_at: None,
        is_edited: false,
        is_deleted: false,
    }
}

pub async fn seed_user(store: &TestStore, id: &str, name: &str) {
    let fields = json!({
        "displayName": name,
        "email": format!("{id}@example.com"),
        "role": "employee",
        "isActive": true,
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

pub async fn seed_message(store: &TestStore, message: &Message) {
    store
        .set_document(
            &codec::message_path(&message.chat_id, &message.id),
            codec::encode(message).unwrap(),
            false,
        )
        .await
        .unwrap();
}

/// Seed `count` messages `m001..` one second apart.
pub async fn seed_history(store: &TestStore, chat: &str, sender: &str, count: usize) {
    for i in 1..=count {
        let m = message(chat, &format!("m{i:03}"), sender, i as i64 * 1_000);
        seed_message(store, &m).await;
    }
}

/// Seed the pair conversation between `a` and `b`, optionally mirroring
/// `last` as its newest message.
pub async fn seed_chat(store: &TestStore, a: &str, b: &str, last_ms: i64, last: Option<&Message>) {
    let (a, b) = (UserId::from(a), UserId::from(b));
    let id = ChatId::for_pair(&a, &b);
    let chat = Chat {
        id: id.clone(),
        participants: vec![a.clone(), b.clone()],
        created_at: Utc.timestamp_millis_opt(0).unwrap(),
        created_by: a.clone(),
        last_message_time: Utc.timestamp_millis_opt(last_ms).unwrap(),
        unread_count: HashMap::from([(a, 0), (b, 0)]),
        last_message: last.map(MessageMirror::from),
    };
    store
        .set_document(&codec::chat_path(&id), codec::encode(&chat).unwrap(), false)
        .await
        .unwrap();
}
