use parley_store::StoreError;
use thiserror::Error;

/// Why a mutation was refused.  Declines are ordinary outcomes the UI
/// turns into a user-facing message, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeclineReason {
    #[error("the edit window for this message has closed")]
    OutsideEditWindow,

    #[error("only the sender may change this message")]
    NotSender,

    #[error("message not found")]
    MessageNotFound,

    #[error("message has been deleted")]
    MessageDeleted,

    #[error("conversation not found")]
    ChatNotFound,

    #[error("user is not a participant of this conversation")]
    NotParticipant,

    #[error("cannot forward a message into its own conversation")]
    SameChat,

    #[error("cannot start a conversation with yourself")]
    SelfChat,

    #[error("message has no content")]
    EmptyMessage,

    #[error("no connection to the server")]
    Offline,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Operation declined: {0}")]
    Declined(DeclineReason),

    #[error("Remote store error: {0}")]
    Remote(StoreError),

    #[error("Malformed document {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode document: {0}")]
    Encode(serde_json::Error),
}

impl SyncError {
    pub fn is_declined(&self) -> bool {
        matches!(self, SyncError::Declined(_))
    }

    pub fn decline_reason(&self) -> Option<DeclineReason> {
        match self {
            SyncError::Declined(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<DeclineReason> for SyncError {
    fn from(reason: DeclineReason) -> Self {
        SyncError::Declined(reason)
    }
}

/// A lost connection is reported as a decline, everything else as a
/// remote failure.
impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable => SyncError::Declined(DeclineReason::Offline),
            other => SyncError::Remote(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
