/// Collection holding user profile documents
pub const USERS_COLLECTION: &str = "users";

/// Collection holding one document per conversation
pub const CHATS_COLLECTION: &str = "chats";

/// Sub-collection name under each chat document
pub const MESSAGES_SUBCOLLECTION: &str = "messages";

/// Collection holding one ephemeral typing document per conversation
pub const TYPING_COLLECTION: &str = "typing";

/// How long a cached user profile stays fresh (5 minutes)
pub const USER_CACHE_TTL_SECS: u64 = 5 * 60;

/// Maximum concurrent user lookups per batch (matches the store's `in` limit)
pub const USER_LOOKUP_BATCH: usize = 10;

/// Conversations per chat list page
pub const CHATS_PER_PAGE: usize = 20;

/// Messages per live window / historical page
pub const MESSAGES_PER_PAGE: usize = 50;

/// Conversations allowed to keep buffered history at once
pub const MAX_CACHED_CHATS: usize = 10;

/// Delay before evicting inactive buffers after a conversation switch
pub const EVICTION_GRACE_MS: u64 = 1_000;

/// Edit / delete window after a message is created (15 minutes)
pub const EDIT_WINDOW_SECS: i64 = 15 * 60;

/// Maximum operations in a single batch write
pub const MAX_BATCH_WRITES: usize = 500;

/// How many recent messages mark-read inspects
pub const MARK_READ_SCAN_LIMIT: usize = 100;

/// Typing debounce window in milliseconds
pub const TYPING_DEBOUNCE_MS: u64 = 500;

/// Typing signal auto-clear after this much inactivity
pub const TYPING_IDLE_CLEAR_MS: u64 = 3_000;

/// Typing entries older than this are ignored by readers
pub const TYPING_STALE_AFTER_SECS: i64 = 10;

/// Placeholder rendered instead of a deleted message's content
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";
