//! Time-bounded cache of user profile snapshots.
//!
//! Cold ids are fetched in bounded batches: lookups inside a batch run
//! concurrently, batches run one after another.  Missing or soft-deleted
//! users are left out of the result and are not remembered, so the next
//! call asks the store again.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parley_shared::constants::USERS_COLLECTION;
use parley_shared::{User, UserId};
use parley_store::RemoteStore;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec;

struct CachedUser {
    user: User,
    fetched_at: Instant,
}

pub struct UserCache {
    store: Arc<dyn RemoteStore>,
    ttl: Duration,
    batch_size: usize,
    entries: Mutex<HashMap<UserId, CachedUser>>,
}

impl UserCache {
    pub fn new(store: Arc<dyn RemoteStore>, ttl: Duration, batch_size: usize) -> Self {
        Self {
            store,
            ttl,
            batch_size: batch_size.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a set of user ids.  Ids that cannot be resolved are absent
    /// from the returned map.
    pub async fn get<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a UserId>,
    ) -> HashMap<UserId, User> {
        let wanted: BTreeSet<UserId> = ids.into_iter().cloned().collect();
        let mut found = HashMap::with_capacity(wanted.len());
        let mut cold = Vec::new();

        {
            let entries = self.entries.lock().await;
            let now = Instant::now();
            for id in wanted {
                match entries.get(&id) {
                    Some(entry) if now.duration_since(entry.fetched_at) < self.ttl => {
                        found.insert(id, entry.user.clone());
                    }
                    _ => cold.push(id),
                }
            }
        }

        if cold.is_empty() {
            debug!(hits = found.len(), "user cache hit");
            return found;
        }
        debug!(hits = found.len(), misses = cold.len(), "user cache miss");

        for batch in cold.chunks(self.batch_size) {
            let lookups = batch.iter().map(|id| self.fetch(id));
            let fetched: Vec<Option<User>> = join_all(lookups).await;

            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            for user in fetched.into_iter().flatten() {
                entries.insert(
                    user.id.clone(),
                    CachedUser {
                        user: user.clone(),
                        fetched_at: now,
                    },
                );
                found.insert(user.id.clone(), user);
            }
        }

        found
    }

    /// Resolve a single user.
    pub async fn get_one(&self, id: &UserId) -> Option<User> {
        self.get([id]).await.remove(id)
    }

    async fn fetch(&self, id: &UserId) -> Option<User> {
        let doc = match self.store.get_document(&codec::user_path(id)).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                debug!(user = %id, "user not found");
                return None;
            }
            Err(e) => {
                warn!(user = %id, error = %e, "user lookup failed");
                return None;
            }
        };

        match codec::decode::<User>(USERS_COLLECTION, &doc) {
            Ok(user) if user.is_deleted => None,
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "malformed user document");
                None
            }
        }
    }

    pub async fn invalidate(&self, id: &UserId) {
        self.entries.lock().await.remove(id);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
