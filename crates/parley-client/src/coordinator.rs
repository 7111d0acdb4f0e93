//! Subscription coordinator.
//!
//! Owns at most one live query per scope kind.  Asking for a new key of a
//! kind that is already subscribed cancels the old live query before the
//! new one is requested; asking again for the current key returns the
//! existing handle.  Every scope change bumps an epoch, and deliveries
//! carrying a stale epoch are dropped, so a late snapshot from a cancelled
//! query never reaches the caller.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use parley_shared::{ChatId, UserId};
use parley_store::{CancelGuard, Query, RemoteStore, Snapshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    ChatList,
    MessageWindow,
    Typing,
}

/// Identity of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    /// Conversation list of a user.
    ChatList(UserId),
    /// Live message window of a conversation.
    MessageWindow(ChatId),
    /// Ephemeral typing document of a conversation.
    Typing(ChatId),
}

impl ScopeKey {
    pub fn kind(&self) -> ScopeKind {
        match self {
            ScopeKey::ChatList(_) => ScopeKind::ChatList,
            ScopeKey::MessageWindow(_) => ScopeKind::MessageWindow,
            ScopeKey::Typing(_) => ScopeKind::Typing,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::ChatList(user) => write!(f, "chat-list:{user}"),
            ScopeKey::MessageWindow(chat) => write!(f, "messages:{chat}"),
            ScopeKey::Typing(chat) => write!(f, "typing:{chat}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Unsubscribed,
    Subscribing,
    Active,
}

struct Slot {
    key: ScopeKey,
    epoch: u64,
    state: ScopeState,
    guard: Option<CancelGuard>,
    task: Option<JoinHandle<()>>,
}

impl Slot {
    fn teardown(self) {
        if let Some(guard) = self.guard {
            guard.cancel();
        }
        if let Some(task) = self.task {
            task.abort();
        }
        debug!(scope = %self.key, epoch = self.epoch, "scope closed");
    }
}

#[derive(Default)]
struct Scopes {
    slots: HashMap<ScopeKind, Slot>,
    next_epoch: u64,
}

impl Scopes {
    fn is_current(&self, kind: ScopeKind, epoch: u64) -> bool {
        self.slots.get(&kind).map(|s| s.epoch) == Some(epoch)
    }
}

fn lock(scopes: &Mutex<Scopes>) -> MutexGuard<'_, Scopes> {
    scopes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cancellation handle for one scope subscription.
///
/// Closing is idempotent, and closing a handle whose scope has since moved
/// to another key does nothing.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    scopes: Weak<Mutex<Scopes>>,
    kind: ScopeKind,
    epoch: u64,
}

impl SubscriptionHandle {
    pub fn close(&self) {
        let Some(scopes) = self.scopes.upgrade() else {
            return;
        };
        let slot = {
            let mut scopes = lock(&scopes);
            if !scopes.is_current(self.kind, self.epoch) {
                return;
            }
            scopes.slots.remove(&self.kind)
        };
        if let Some(slot) = slot {
            slot.teardown();
        }
    }

    /// Whether this handle still owns a live query.
    pub fn is_active(&self) -> bool {
        let Some(scopes) = self.scopes.upgrade() else {
            return false;
        };
        let active = lock(&scopes)
            .slots
            .get(&self.kind)
            .is_some_and(|s| s.epoch == self.epoch && s.state == ScopeState::Active);
        active
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }
}

pub struct SubscriptionCoordinator {
    store: Arc<dyn RemoteStore>,
    scopes: Arc<Mutex<Scopes>>,
}

impl SubscriptionCoordinator {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            scopes: Arc::new(Mutex::new(Scopes::default())),
        }
    }

    /// Subscribe `key` to `query`.
    ///
    /// Each snapshot is passed through `enrich` and the result handed to
    /// `deliver`.  Subscription errors are logged and leave the scope
    /// unsubscribed; delivery errors are logged and nothing is delivered.
    pub async fn subscribe<T, E, Fut, D>(
        &self,
        key: ScopeKey,
        query: Query,
        enrich: E,
        deliver: D,
    ) -> SubscriptionHandle
    where
        T: Send + 'static,
        E: Fn(Snapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        let kind = key.kind();

        let (epoch, previous) = {
            let mut scopes = lock(&self.scopes);
            if let Some(slot) = scopes.slots.get(&kind) {
                if slot.key == key && slot.state != ScopeState::Unsubscribed {
                    debug!(scope = %key, "already subscribed");
                    return self.handle(kind, slot.epoch);
                }
            }
            scopes.next_epoch += 1;
            let epoch = scopes.next_epoch;
            let previous = scopes.slots.insert(
                kind,
                Slot {
                    key: key.clone(),
                    epoch,
                    state: ScopeState::Subscribing,
                    guard: None,
                    task: None,
                },
            );
            (epoch, previous)
        };

        // The old live query is gone before the new one is requested.
        if let Some(previous) = previous {
            previous.teardown();
        }

        let subscription = match self.store.subscribe(query).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(scope = %key, error = %e, "subscribe failed");
                let mut scopes = lock(&self.scopes);
                if let Some(slot) = scopes.slots.get_mut(&kind) {
                    if slot.epoch == epoch {
                        slot.state = ScopeState::Unsubscribed;
                    }
                }
                return self.handle(kind, epoch);
            }
        };

        let (mut rx, guard) = subscription.into_parts();

        let mut scopes = lock(&self.scopes);
        let Some(slot) = scopes.slots.get_mut(&kind).filter(|s| s.epoch == epoch) else {
            // Superseded while the request was in flight; dropping the
            // guard cancels the live query.
            debug!(scope = %key, "scope changed during subscribe");
            return self.handle(kind, epoch);
        };

        let weak = Arc::downgrade(&self.scopes);
        let scope_name = key.to_string();
        let task = tokio::spawn(async move {
            let is_current = |weak: &Weak<Mutex<Scopes>>| match weak.upgrade() {
                Some(scopes) => {
                    let current = lock(&scopes).is_current(kind, epoch);
                    current
                }
                None => false,
            };
            while let Some(delivery) = rx.recv().await {
                if !is_current(&weak) {
                    break;
                }
                match delivery {
                    Ok(snapshot) => {
                        let value = enrich(snapshot).await;
                        if !is_current(&weak) {
                            break;
                        }
                        deliver(value);
                    }
                    Err(e) => {
                        warn!(scope = %scope_name, error = %e, "live query error");
                    }
                }
            }
            debug!(scope = %scope_name, "delivery loop finished");
        });

        slot.guard = Some(guard);
        slot.task = Some(task);
        slot.state = ScopeState::Active;
        info!(scope = %key, epoch, "scope active");

        drop(scopes);
        self.handle(kind, epoch)
    }

    fn handle(&self, kind: ScopeKind, epoch: u64) -> SubscriptionHandle {
        SubscriptionHandle {
            scopes: Arc::downgrade(&self.scopes),
            kind,
            epoch,
        }
    }

    /// Close whatever is subscribed for `kind`.
    pub fn close(&self, kind: ScopeKind) {
        let slot = lock(&self.scopes).slots.remove(&kind);
        if let Some(slot) = slot {
            slot.teardown();
        }
    }

    pub fn close_all(&self) {
        let slots: Vec<Slot> = lock(&self.scopes).slots.drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.teardown();
        }
    }

    pub fn state(&self, kind: ScopeKind) -> ScopeState {
        lock(&self.scopes)
            .slots
            .get(&kind)
            .map(|s| s.state)
            .unwrap_or(ScopeState::Unsubscribed)
    }

    /// The key currently subscribed (or subscribing) for `kind`.
    pub fn active_key(&self, kind: ScopeKind) -> Option<ScopeKey> {
        lock(&self.scopes)
            .slots
            .get(&kind)
            .filter(|s| s.state != ScopeState::Unsubscribed)
            .map(|s| s.key.clone())
    }

    pub fn active_count(&self) -> usize {
        lock(&self.scopes)
            .slots
            .values()
            .filter(|s| s.state == ScopeState::Active)
            .count()
    }
}

impl Drop for SubscriptionCoordinator {
    fn drop(&mut self) {
        self.close_all();
    }
}
