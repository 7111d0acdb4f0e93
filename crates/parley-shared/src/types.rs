use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::DELETED_PLACEHOLDER;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

// User identity = the identity subsystem's uid string
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    /// Deterministic id for the one conversation between two users.
    ///
    /// The pair is unordered: `for_pair(a, b) == for_pair(b, a)`.  Each id
    /// is escaped so that `_` only ever appears as the separator, which
    /// keeps distinct pairs on distinct documents.
    pub fn for_pair(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}_{}", escape_pair_part(lo), escape_pair_part(hi)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape_pair_part(id: &UserId) -> String {
    let mut out = String::with_capacity(id.0.len());
    for c in id.0.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '_' => out.push_str("%5F"),
            c => out.push(c),
        }
    }
    out
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Employee,
}

/// A user profile snapshot.  Owned by the identity subsystem; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub role: Role,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Soft-delete marker set by the admin tooling.
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
}

impl User {
    /// Whether this user may appear in participant lists shown to others.
    pub fn is_visible(&self) -> bool {
        self.is_active && !self.is_deleted
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A one-to-one conversation document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub participants: Vec<UserId>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub created_by: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_message_time: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: HashMap<UserId, i64>,
    /// Denormalized copy of the newest message, enough to render a list row.
    #[serde(default)]
    pub last_message: Option<MessageMirror>,
}

impl Chat {
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// Whether this is the one-to-one conversation of exactly `a` and `b`.
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        self.participants.len() == 2 && self.has_participant(a) && self.has_participant(b)
    }

    /// The other party of the conversation, if any.
    pub fn counterpart(&self, me: &UserId) -> Option<&UserId> {
        self.participants.iter().find(|p| *p != me)
    }

    pub fn unread_for(&self, user: &UserId) -> i64 {
        self.unread_count.get(user).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
    Voice,
}

/// Quote of the message being replied to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub message_id: MessageId,
    pub content: String,
    pub sender_name: String,
}

impl From<&Message> for ReplyRef {
    fn from(m: &Message) -> Self {
        Self {
            message_id: m.id.clone(),
            content: m.content.clone(),
            sender_name: m.sender_name.clone(),
        }
    }
}

/// Provenance stamped on forwarded copies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRef {
    pub sender_name: String,
    pub original_chat_id: ChatId,
}

/// An already-uploaded file handed over by the media collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    pub file_name: String,
    pub file_size: Option<u64>,
    pub kind: MessageKind,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, rename = "fileURL")]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub reply_to: Option<ReplyRef>,
    #[serde(default)]
    pub forwarded_from: Option<ForwardRef>,
    /// Grows by set-union only.
    #[serde(default)]
    pub read_by: Vec<UserId>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Message {
    /// Text to render; deleted messages never expose their stored content.
    pub fn display_content(&self) -> &str {
        if self.is_deleted {
            DELETED_PLACEHOLDER
        } else {
            &self.content
        }
    }

    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.contains(user)
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.file_url.as_ref().map(|url| Attachment {
            url: url.clone(),
            file_name: self.file_name.clone().unwrap_or_default(),
            file_size: self.file_size,
            kind: self.kind,
        })
    }
}

/// Denormalized summary of a conversation's newest message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMirror {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, rename = "fileURL")]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub read_by: Vec<UserId>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

impl MessageMirror {
    pub fn display_content(&self) -> &str {
        if self.is_deleted {
            DELETED_PLACEHOLDER
        } else {
            &self.content
        }
    }

    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.contains(user)
    }
}

impl From<&Message> for MessageMirror {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id.clone(),
            sender_id: m.sender_id.clone(),
            sender_name: m.sender_name.clone(),
            content: m.content.clone(),
            kind: m.kind,
            file_url: m.file_url.clone(),
            file_name: m.file_name.clone(),
            file_size: m.file_size,
            read_by: m.read_by.clone(),
            created_at: m.created_at,
            is_edited: m.is_edited,
            is_deleted: m.is_deleted,
        }
    }
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

/// One user's entry in a conversation's ephemeral typing document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingEntry {
    pub display_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}
