//! # parley-client
//!
//! Client-side synchronization core for one-to-one messaging over a
//! remote document store: live conversation list, paged message windows,
//! batched user lookups, typing signals and the write paths that keep
//! unread counters and last-message mirrors consistent.

pub mod chat_list;
pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod message_store;
pub mod mutations;
pub mod session;
pub mod typing;
pub mod user_cache;

#[cfg(test)]
mod testing;

use tracing_subscriber::{fmt, EnvFilter};

pub use chat_list::{ChatListAggregator, ChatListEntry, ChatListFilter, ChatListUpdate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use coordinator::{ScopeKey, ScopeKind, ScopeState, SubscriptionCoordinator, SubscriptionHandle};
pub use error::{DeclineReason, Result, SyncError};
pub use message_store::{MessageStore, PageResult};
pub use mutations::{Identity, MutationEngine, MutationPolicy, OutgoingMessage};
pub use session::{ChatEvent, ChatSession, MessageWindowUpdate};
pub use typing::{TypingDebouncer, TypingPhase, TypingSignal};
pub use user_cache::UserCache;

/// Install a `tracing` subscriber honouring `RUST_LOG`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley_client=debug,parley_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
