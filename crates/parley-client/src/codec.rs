//! Mapping between store documents and domain models.

use parley_shared::constants::{
    CHATS_COLLECTION, MESSAGES_SUBCOLLECTION, TYPING_COLLECTION, USERS_COLLECTION,
};
use parley_shared::{ChatId, MessageId, UserId};
use parley_store::{DocPath, Document, Fields};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, SyncError};

pub fn user_path(id: &UserId) -> DocPath {
    DocPath::new(USERS_COLLECTION, id.as_str())
}

pub fn chat_path(id: &ChatId) -> DocPath {
    DocPath::new(CHATS_COLLECTION, id.as_str())
}

/// `chats/{chatId}/messages`
pub fn messages_collection(chat: &ChatId) -> String {
    format!("{CHATS_COLLECTION}/{chat}/{MESSAGES_SUBCOLLECTION}")
}

pub fn message_path(chat: &ChatId, id: &MessageId) -> DocPath {
    DocPath::new(messages_collection(chat), id.as_str())
}

pub fn typing_path(chat: &ChatId) -> DocPath {
    DocPath::new(TYPING_COLLECTION, chat.as_str())
}

/// Decode a document, injecting its id as the `id` field.
pub fn decode<T: DeserializeOwned>(collection: &str, doc: &Document) -> Result<T> {
    serde_json::from_value(doc.to_value_with_id()).map_err(|source| SyncError::Decode {
        path: format!("{collection}/{}", doc.id),
        source,
    })
}

/// Decode every document of a snapshot, skipping (and logging) malformed ones.
pub fn decode_all<'a, T: DeserializeOwned>(
    collection: &str,
    docs: impl IntoIterator<Item = &'a Document>,
) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| match decode(collection, doc) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed document");
                None
            }
        })
        .collect()
}

/// Encode a model as document fields.  The id lives in the path, not the body.
pub fn encode<T: Serialize>(value: &T) -> Result<Fields> {
    let encoded = serde_json::to_value(value).map_err(SyncError::Encode)?;
    match encoded {
        Value::Object(mut fields) => {
            fields.remove("id");
            Ok(fields)
        }
        _ => Ok(Fields::new()),
    }
}

/// Encode a value for use inside an update operation.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(SyncError::Encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parley_shared::Chat;
    use std::collections::HashMap;

    #[test]
    fn test_paths() {
        let chat = ChatId::from("a_b");
        assert_eq!(messages_collection(&chat), "chats/a_b/messages");
        assert_eq!(
            message_path(&chat, &MessageId::from("m1")).to_string(),
            "chats/a_b/messages/m1"
        );
        assert_eq!(typing_path(&chat).to_string(), "typing/a_b");
    }

    #[test]
    fn test_encode_strips_id_and_decode_restores_it() {
        let chat = Chat {
            id: ChatId::from("a_b"),
            participants: vec![UserId::from("a"), UserId::from("b")],
            created_at: Utc.timestamp_millis_opt(10).unwrap(),
            created_by: UserId::from("a"),
            last_message_time: Utc.timestamp_millis_opt(10).unwrap(),
            unread_count: HashMap::new(),
            last_message: None,
        };
        let fields = encode(&chat).unwrap();
        assert!(!fields.contains_key("id"));

        let decoded: Chat = decode("chats", &Document::new("a_b", fields)).unwrap();
        assert_eq!(decoded, chat);
    }

    #[test]
    fn test_decode_all_skips_malformed() {
        let good = serde_json::json!({
            "participants": ["a", "b"],
            "createdAt": 0,
            "createdBy": "a",
            "lastMessageTime": 0,
        });
        let docs = vec![
            Document::new("ok", good.as_object().unwrap().clone()),
            Document::new("bad", Fields::new()),
        ];
        let chats: Vec<Chat> = decode_all("chats", &docs);
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].id.as_str(), "ok");
    }
}
