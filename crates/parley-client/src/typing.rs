//! Typing indicator.
//!
//! Each conversation has one ephemeral document under `typing/{chatId}`
//! mapping user ids to `{displayName, timestamp}`.  [`TypingSignal`] is the
//! raw write primitive; [`TypingDebouncer`] sits above it and bounds how
//! often keystrokes turn into writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_shared::constants::TYPING_COLLECTION;
use parley_shared::{ChatId, TypingEntry, UserId};
use parley_store::{FieldPath, Fields, RemoteStore, Snapshot, Update};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::codec;
use crate::error::Result;
use crate::mutations::Identity;

pub struct TypingSignal {
    store: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
}

impl TypingSignal {
    pub fn new(store: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Publish or withdraw `user`'s typing entry without touching anyone
    /// else's.  The document is removed once no entries remain.
    pub async fn set_typing(
        &self,
        chat: &ChatId,
        user: &UserId,
        display_name: &str,
        typing: bool,
    ) -> Result<()> {
        let path = codec::typing_path(chat);

        if typing {
            let entry = TypingEntry {
                display_name: display_name.to_string(),
                timestamp: self.clock.now(),
            };
            let mut fields = Fields::new();
            fields.insert(user.to_string(), codec::to_value(&entry)?);
            self.store.set_document(&path, fields, true).await?;
            return Ok(());
        }

        let Some(doc) = self.store.get_document(&path).await? else {
            return Ok(());
        };
        if !doc.fields.contains_key(user.as_str()) {
            return Ok(());
        }
        if doc.fields.len() == 1 {
            self.store.delete_document(&path).await?;
        } else {
            self.store
                .update_document(&path, Update::new().delete(FieldPath::at([user.as_str()])))
                .await?;
        }
        Ok(())
    }
}

/// Display names of other users with a fresh entry in a typing snapshot.
pub fn typing_users(
    snapshot: &Snapshot,
    me: &UserId,
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
) -> Vec<String> {
    let Some(doc) = snapshot.docs.first() else {
        return Vec::new();
    };
    let mut names: Vec<String> = doc
        .fields
        .iter()
        .filter(|(uid, _)| uid.as_str() != me.as_str())
        .filter_map(|(uid, value)| match serde_json::from_value::<TypingEntry>(value.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(collection = TYPING_COLLECTION, user = %uid, error = %e, "malformed typing entry");
                None
            }
        })
        .filter(|entry| now.signed_duration_since(entry.timestamp) <= stale_after)
        .map(|entry| entry.display_name)
        .collect();
    names.sort();
    names
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingPhase {
    /// Nothing posted, no timer running.
    Idle,
    /// A keystroke arrived; the signal is posted when the debounce elapses.
    Pending,
    /// The signal is posted; it is withdrawn after the idle timeout.
    Posted,
}

enum Command {
    Keystroke,
    Stop,
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy)]
pub struct DebounceTimings {
    pub debounce: Duration,
    pub idle_clear: Duration,
}

/// Per-conversation typing state machine.
///
/// The first keystroke arms the debounce; later keystrokes only move the
/// idle deadline, so a burst of typing costs one write to post and one to
/// clear.  Dropping the debouncer withdraws a posted signal.
pub struct TypingDebouncer {
    chat: ChatId,
    tx: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<TypingPhase>,
    task: JoinHandle<()>,
}

impl TypingDebouncer {
    pub fn spawn(
        signal: Arc<TypingSignal>,
        chat: ChatId,
        identity: Identity,
        timings: DebounceTimings,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (phase_tx, phase) = watch::channel(TypingPhase::Idle);
        let task = tokio::spawn(run(signal, chat.clone(), identity, timings, rx, phase_tx));
        Self {
            chat,
            tx,
            phase,
            task,
        }
    }

    pub fn chat(&self) -> &ChatId {
        &self.chat
    }

    pub fn keystroke(&self) {
        let _ = self.tx.send(Command::Keystroke);
    }

    /// Withdraw the signal now (message sent, input cleared).
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }

    pub fn phase(&self) -> TypingPhase {
        *self.phase.borrow()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the state machine, waiting until a posted signal is withdrawn.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn post(signal: &TypingSignal, chat: &ChatId, identity: &Identity, typing: bool) {
    if let Err(e) = signal
        .set_typing(chat, &identity.user_id, &identity.display_name, typing)
        .await
    {
        warn!(chat = %chat, typing, error = %e, "typing signal not delivered");
    }
}

async fn run(
    signal: Arc<TypingSignal>,
    chat: ChatId,
    identity: Identity,
    timings: DebounceTimings,
    mut rx: mpsc::UnboundedReceiver<Command>,
    phase_tx: watch::Sender<TypingPhase>,
) {
    let mut phase = TypingPhase::Idle;
    let mut deadline: Option<Instant> = None;
    let mut last_keystroke = Instant::now();

    loop {
        let timer = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Keystroke) => {
                    last_keystroke = Instant::now();
                    match phase {
                        TypingPhase::Idle => {
                            phase = TypingPhase::Pending;
                            deadline = Some(last_keystroke + timings.debounce);
                        }
                        TypingPhase::Pending => {}
                        TypingPhase::Posted => {
                            deadline = Some(last_keystroke + timings.idle_clear);
                        }
                    }
                }
                Some(Command::Stop) => {
                    if phase == TypingPhase::Posted {
                        post(&signal, &chat, &identity, false).await;
                    }
                    phase = TypingPhase::Idle;
                    deadline = None;
                }
                Some(Command::Shutdown(done)) => {
                    if phase == TypingPhase::Posted {
                        post(&signal, &chat, &identity, false).await;
                    }
                    phase_tx.send_replace(TypingPhase::Idle);
                    let _ = done.send(());
                    break;
                }
                None => {
                    if phase == TypingPhase::Posted {
                        post(&signal, &chat, &identity, false).await;
                    }
                    phase_tx.send_replace(TypingPhase::Idle);
                    break;
                }
            },
            _ = timer => match phase {
                TypingPhase::Pending => {
                    post(&signal, &chat, &identity, true).await;
                    phase = TypingPhase::Posted;
                    deadline = Some(last_keystroke + timings.idle_clear);
                }
                TypingPhase::Posted => {
                    post(&signal, &chat, &identity, false).await;
                    phase = TypingPhase::Idle;
                    deadline = None;
                }
                TypingPhase::Idle => deadline = None,
            },
        }

        phase_tx.send_replace(phase);
    }
    debug!(chat = %chat, "typing debouncer stopped");
}
