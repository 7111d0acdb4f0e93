// Domain model shared by the store adapter and the sync core.

pub mod constants;
pub mod types;

pub use types::{
    Attachment, Chat, ChatId, ForwardRef, Message, MessageId, MessageKind, MessageMirror,
    ReplyRef, Role, TypingEntry, User, UserId,
};
