//! Sync core configuration loaded from environment variables.
//!
//! All settings default to the reference behavior, so a session can start
//! with zero configuration.

use std::time::Duration;

use parley_shared::constants::{
    CHATS_PER_PAGE, EDIT_WINDOW_SECS, EVICTION_GRACE_MS, MARK_READ_SCAN_LIMIT,
    MAX_BATCH_WRITES, MAX_CACHED_CHATS, MESSAGES_PER_PAGE, TYPING_DEBOUNCE_MS,
    TYPING_IDLE_CLEAR_MS, TYPING_STALE_AFTER_SECS, USER_CACHE_TTL_SECS, USER_LOOKUP_BATCH,
};

/// Sync core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long a cached user profile is served without refetching.
    /// Env: `PARLEY_USER_CACHE_TTL_SECS`
    /// Default: 300 seconds.
    pub user_cache_ttl: Duration,

    /// Cold user lookups issued concurrently per batch.
    /// Env: `PARLEY_USER_BATCH_SIZE`
    /// Default: `10`
    pub user_batch_size: usize,

    /// Conversations per chat list page.
    /// Env: `PARLEY_CHAT_PAGE_SIZE`
    /// Default: `20`
    pub chat_page_size: usize,

    /// Messages in the live window and in each historical page.
    /// Env: `PARLEY_MESSAGE_PAGE_SIZE`
    /// Default: `50`
    pub message_page_size: usize,

    /// Conversations allowed to keep buffered history.
    /// Env: `PARLEY_MAX_CACHED_CHATS`
    /// Default: `10`
    pub max_cached_chats: usize,

    /// Delay between a conversation switch and evicting idle buffers.
    /// Env: `PARLEY_EVICTION_GRACE_MS`
    /// Default: 1000 ms.
    pub eviction_grace: Duration,

    /// Edit / delete window after creation.
    /// Env: `PARLEY_EDIT_WINDOW_SECS`
    /// Default: 900 seconds.
    pub edit_window: chrono::Duration,

    /// Operations per write batch when marking messages read.
    pub write_batch_size: usize,

    /// Recent messages inspected by mark-read.
    pub mark_read_scan_limit: usize,

    /// Env: `PARLEY_TYPING_DEBOUNCE_MS`
    /// Default: 500 ms.
    pub typing_debounce: Duration,

    /// Env: `PARLEY_TYPING_IDLE_CLEAR_MS`
    /// Default: 3000 ms.
    pub typing_idle_clear: Duration,

    /// Typing entries older than this are not shown.
    pub typing_stale_after: chrono::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_cache_ttl: Duration::from_secs(USER_CACHE_TTL_SECS),
            user_batch_size: USER_LOOKUP_BATCH,
            chat_page_size: CHATS_PER_PAGE,
            message_page_size: MESSAGES_PER_PAGE,
            max_cached_chats: MAX_CACHED_CHATS,
            eviction_grace: Duration::from_millis(EVICTION_GRACE_MS),
            edit_window: chrono::Duration::seconds(EDIT_WINDOW_SECS),
            write_batch_size: MAX_BATCH_WRITES,
            mark_read_scan_limit: MARK_READ_SCAN_LIMIT,
            typing_debounce: Duration::from_millis(TYPING_DEBOUNCE_MS),
            typing_idle_clear: Duration::from_millis(TYPING_IDLE_CLEAR_MS),
            typing_stale_after: chrono::Duration::seconds(TYPING_STALE_AFTER_SECS),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(secs) = parse_positive(&lookup, "PARLEY_USER_CACHE_TTL_SECS") {
            config.user_cache_ttl = Duration::from_secs(secs);
        }

        if let Some(n) = parse_positive(&lookup, "PARLEY_USER_BATCH_SIZE") {
            config.user_batch_size = n as usize;
        }

        if let Some(n) = parse_positive(&lookup, "PARLEY_CHAT_PAGE_SIZE") {
            config.chat_page_size = n as usize;
        }

        if let Some(n) = parse_positive(&lookup, "PARLEY_MESSAGE_PAGE_SIZE") {
            config.message_page_size = n as usize;
        }

        if let Some(n) = parse_positive(&lookup, "PARLEY_MAX_CACHED_CHATS") {
            config.max_cached_chats = n as usize;
        }

        if let Some(ms) = parse_positive(&lookup, "PARLEY_EVICTION_GRACE_MS") {
            config.eviction_grace = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_positive(&lookup, "PARLEY_EDIT_WINDOW_SECS") {
            match i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds) {
                Some(window) => config.edit_window = window,
                None => tracing::warn!(
                    key = "PARLEY_EDIT_WINDOW_SECS",
                    value = secs,
                    "edit window out of range, using default"
                ),
            }
        }

        if let Some(ms) = parse_positive(&lookup, "PARLEY_TYPING_DEBOUNCE_MS") {
            config.typing_debounce = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_positive(&lookup, "PARLEY_TYPING_IDLE_CLEAR_MS") {
            config.typing_idle_clear = Duration::from_millis(ms);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse a strictly positive integer, warning about unusable values.
fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
