//! Mutation policy engine.
//!
//! Every write that can change a conversation's newest message also keeps
//! the chat document's `lastMessage` mirror and unread counters in step.
//! Edit and delete are only allowed to the sender, inside the edit window.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parley_shared::constants::CHATS_COLLECTION;
use parley_shared::{
    Attachment, Chat, ChatId, ForwardRef, Message, MessageId, MessageKind, MessageMirror,
    ReplyRef, UserId,
};
use parley_store::{
    DocPath, Direction, FieldPath, Query, RemoteStore, StoreError, Update, WriteOp,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::codec;
use crate::config::SyncConfig;
use crate::error::{DeclineReason, Result};

/// The signed-in user, as supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId(user_id.into()),
            display_name: display_name.into(),
        }
    }
}

/// Content of a message about to be sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: String,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<ReplyRef>,
    forwarded_from: Option<ForwardRef>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn replying_to(mut self, message: &Message) -> Self {
        self.reply_to = Some(ReplyRef::from(message));
        self
    }

    fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.attachment.is_none()
    }
}

/// The edit / delete rule, free of any I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationPolicy {
    window: Duration,
}

impl MutationPolicy {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Allowed only to the sender while `now - createdAt <= window`.
    pub fn check(
        &self,
        message: &Message,
        requester: &UserId,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), DeclineReason> {
        if &message.sender_id != requester {
            return Err(DeclineReason::NotSender);
        }
        if now.signed_duration_since(message.created_at) > self.window {
            return Err(DeclineReason::OutsideEditWindow);
        }
        Ok(())
    }
}

pub struct MutationEngine {
    store: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    policy: MutationPolicy,
    write_batch_size: usize,
    mark_read_scan_limit: usize,
}

impl MutationEngine {
    pub fn new(store: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
        Self {
            store,
            clock,
            policy: MutationPolicy::new(config.edit_window),
            write_batch_size: config.write_batch_size.max(1),
            mark_read_scan_limit: config.mark_read_scan_limit.max(1),
        }
    }

    pub fn policy(&self) -> MutationPolicy {
        self.policy
    }

    async fn load_chat(&self, chat_id: &ChatId) -> Result<Chat> {
        let doc = self
            .store
            .get_document(&codec::chat_path(chat_id))
            .await?
            .ok_or(DeclineReason::ChatNotFound)?;
        codec::decode(CHATS_COLLECTION, &doc)
    }

    async fn load_message(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<Message> {
        let doc = self
            .store
            .get_document(&codec::message_path(chat_id, message_id))
            .await?
            .ok_or(DeclineReason::MessageNotFound)?;
        codec::decode(&codec::messages_collection(chat_id), &doc)
    }

    /// Return the one conversation between `me` and `other`, creating it if
    /// needed.  Concurrent callers for the same pair get the same id.
    pub async fn create_or_get_chat(&self, me: &UserId, other: &UserId) -> Result<ChatId> {
        if me == other {
            return Err(DeclineReason::SelfChat.into());
        }

        let pair_id = ChatId::for_pair(me, other);
        let pair_path = codec::chat_path(&pair_id);
        let occupied = match self.pair_owner(&pair_path, me, other).await? {
            Some(true) => return Ok(pair_id),
            Some(false) => {
                warn!(chat = %pair_id, "pair document holds other participants");
                true
            }
            None => false,
        };

        // Conversations created before pair ids were deterministic.
        let mine = self
            .store
            .query(&Query::new(CHATS_COLLECTION).array_contains("participants", me.as_str()))
            .await?;
        let legacy = codec::decode_all::<Chat>(CHATS_COLLECTION, mine.iter())
            .into_iter()
            .find(|c| c.participants.len() == 2 && c.has_participant(other));
        if let Some(chat) = legacy {
            debug!(chat = %chat.id, "found existing conversation");
            return Ok(chat.id);
        }

        if occupied {
            return Err(StoreError::AlreadyExists(pair_path.to_string()).into());
        }

        let now = self.clock.now();
        let chat = Chat {
            id: pair_id.clone(),
            participants: vec![me.clone(), other.clone()],
            created_at: now,
            created_by: me.clone(),
            last_message_time: now,
            unread_count: [(me.clone(), 0), (other.clone(), 0)].into_iter().collect(),
            last_message: None,
        };
        match self
            .store
            .create_document_with_id(&pair_path, codec::encode(&chat)?)
            .await
        {
            Ok(()) => {
                info!(chat = %pair_id, "conversation created");
                Ok(pair_id)
            }
            Err(StoreError::AlreadyExists(path)) => {
                if self.pair_owner(&pair_path, me, other).await? == Some(true) {
                    debug!(chat = %pair_id, "conversation created concurrently");
                    Ok(pair_id)
                } else {
                    Err(StoreError::AlreadyExists(path).into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `None` if the pair document is absent, otherwise whether it is the
    /// conversation of exactly `me` and `other`.
    async fn pair_owner(
        &self,
        path: &DocPath,
        me: &UserId,
        other: &UserId,
    ) -> Result<Option<bool>> {
        let Some(doc) = self.store.get_document(path).await? else {
            return Ok(None);
        };
        let owned = codec::decode::<Chat>(CHATS_COLLECTION, &doc)
            .map(|chat| chat.is_between(me, other))
            .unwrap_or(false);
        Ok(Some(owned))
    }

    /// Append a message and update the mirror and unread counters.
    pub async fn send(
        &self,
        chat_id: &ChatId,
        sender: &Identity,
        outgoing: OutgoingMessage,
    ) -> Result<Message> {
        if outgoing.is_empty() {
            return Err(DeclineReason::EmptyMessage.into());
        }
        let chat = self.load_chat(chat_id).await?;
        if !chat.has_participant(&sender.user_id) {
            return Err(DeclineReason::NotParticipant.into());
        }

        let attachment = outgoing.attachment;
        let message = Message {
            id: MessageId::new(),
            chat_id: chat_id.clone(),
            sender_id: sender.user_id.clone(),
            sender_name: sender.display_name.clone(),
            content: outgoing.content,
            kind: attachment
                .as_ref()
                .map(|a| a.kind)
                .unwrap_or(MessageKind::Text),
            file_url: attachment.as_ref().map(|a| a.url.clone()),
            file_name: attachment.as_ref().map(|a| a.file_name.clone()),
            file_size: attachment.as_ref().and_then(|a| a.file_size),
            reply_to: outgoing.reply_to,
            forwarded_from: outgoing.forwarded_from,
            read_by: vec![sender.user_id.clone()],
            created_at: self.clock.now(),
            updated_at: None,
            is_edited: false,
            is_deleted: false,
        };

        let mut chat_update = Update::new()
            .set("lastMessage", codec::to_value(&MessageMirror::from(&message))?)
            .set("lastMessageTime", message.created_at.timestamp_millis());
        for participant in chat.participants.iter().filter(|p| **p != sender.user_id) {
            chat_update = chat_update
                .increment(FieldPath::at(["unreadCount", participant.as_str()]), 1);
        }

        self.store
            .batch_write(vec![
                WriteOp::Create {
                    path: codec::message_path(chat_id, &message.id),
                    fields: codec::encode(&message)?,
                },
                WriteOp::Update {
                    path: codec::chat_path(chat_id),
                    update: chat_update,
                },
            ])
            .await?;

        debug!(chat = %chat_id, message = %message.id, "message sent");
        Ok(message)
    }

    /// Copy `message` into another conversation.
    pub async fn forward(
        &self,
        message: &Message,
        target: &ChatId,
        sender: &Identity,
    ) -> Result<Message> {
        if &message.chat_id == target {
            return Err(DeclineReason::SameChat.into());
        }
        if message.is_deleted {
            return Err(DeclineReason::MessageDeleted.into());
        }
        let outgoing = OutgoingMessage {
            content: message.content.clone(),
            attachment: message.attachment(),
            reply_to: None,
            forwarded_from: Some(ForwardRef {
                sender_name: message.sender_name.clone(),
                original_chat_id: message.chat_id.clone(),
            }),
        };
        self.send(target, sender, outgoing).await
    }

    /// Replace the text of a message.
    pub async fn edit(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        requester: &UserId,
        content: &str,
    ) -> Result<()> {
        if content.trim().is_empty() {
            return Err(DeclineReason::EmptyMessage.into());
        }
        let message = self.load_message(chat_id, message_id).await?;
        let now = self.clock.now();
        self.policy.check(&message, requester, now)?;
        if message.is_deleted {
            return Err(DeclineReason::MessageDeleted.into());
        }

        let update = Update::new()
            .set("content", content)
            .set("isEdited", true)
            .set("updatedAt", now.timestamp_millis());
        let mirror_patch = Update::new()
            .set("lastMessage.content", content)
            .set("lastMessage.isEdited", true);
        self.patch(chat_id, message_id, update, mirror_patch).await?;
        debug!(chat = %chat_id, message = %message_id, "message edited");
        Ok(())
    }

    /// Mark a message deleted.  The stored content is left as it was and
    /// readers render a placeholder instead.
    pub async fn delete(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        requester: &UserId,
    ) -> Result<()> {
        let message = self.load_message(chat_id, message_id).await?;
        let now = self.clock.now();
        self.policy.check(&message, requester, now)?;
        if message.is_deleted {
            return Ok(());
        }

        let update = Update::new()
            .set("isDeleted", true)
            .set("updatedAt", now.timestamp_millis());
        let mirror_patch = Update::new().set("lastMessage.isDeleted", true);
        self.patch(chat_id, message_id, update, mirror_patch).await?;
        debug!(chat = %chat_id, message = %message_id, "message deleted");
        Ok(())
    }

    /// Update a message and, when it is the conversation's mirrored last
    /// message, the mirror too.  The mirror may lag until the next write if
    /// a newer message lands between the read and the batch.
    async fn patch(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        update: Update,
        mirror_patch: Update,
    ) -> Result<()> {
        let chat = self.load_chat(chat_id).await?;
        let mut ops = vec![WriteOp::Update {
            path: codec::message_path(chat_id, message_id),
            update,
        }];
        if chat.last_message.as_ref().map(|m| &m.id) == Some(message_id) {
            ops.push(WriteOp::Update {
                path: codec::chat_path(chat_id),
                update: mirror_patch,
            });
        }
        self.store.batch_write(ops).await?;
        Ok(())
    }

    /// Add `reader` to `readBy` of the recent messages it has not read and
    /// reset its unread counter.  Returns how many messages were marked.
    pub async fn mark_read(&self, chat_id: &ChatId, reader: &UserId) -> Result<usize> {
        let chat = self.load_chat(chat_id).await?;
        if !chat.has_participant(reader) {
            return Err(DeclineReason::NotParticipant.into());
        }

        let collection = codec::messages_collection(chat_id);
        let recent = self
            .store
            .query(
                &Query::new(collection.clone())
                    .order_by("createdAt", Direction::Descending)
                    .limit(self.mark_read_scan_limit),
            )
            .await?;
        let unread: Vec<MessageId> = codec::decode_all::<Message>(&collection, recent.iter())
            .into_iter()
            .filter(|m| !m.is_read_by(reader))
            .map(|m| m.id)
            .collect();

        if unread.is_empty() && chat.unread_for(reader) == 0 {
            return Ok(0);
        }

        let reader_value = Value::from(reader.as_str());
        for chunk in unread.chunks(self.write_batch_size) {
            let ops = chunk
                .iter()
                .map(|id| WriteOp::Update {
                    path: codec::message_path(chat_id, id),
                    update: Update::new().array_union("readBy", vec![reader_value.clone()]),
                })
                .collect();
            self.store.batch_write(ops).await?;
        }

        let marked: HashSet<&MessageId> = unread.iter().collect();
        let mut chat_update =
            Update::new().set(FieldPath::at(["unreadCount", reader.as_str()]), 0);
        if let Some(mirror) = &chat.last_message {
            if marked.contains(&mirror.id) {
                chat_update = chat_update.array_union("lastMessage.readBy", vec![reader_value]);
            }
        }
        self.store
            .update_document(&codec::chat_path(chat_id), chat_update)
            .await?;

        debug!(chat = %chat_id, reader = %reader, marked = unread.len(), "marked read");
        Ok(unread.len())
    }
}
