//! # Message Store
//!
//! Single source of truth for threads and their messages.
//!
//! ```text
//! MessageStore (Clone, Arc inside)
//! ├── state: Mutex<StoreState>
//! │   ├── threads: HashMap<ThreadId, ThreadEntry>   // message order + typing flag
//! │   ├── messages: HashMap<MessageId, Message>
//! │   └── listeners: HashMap<ThreadId, Vec<..>>
//! └── notify: Mutex<()>                              // serializes mutate + notify
//! ```
//!
//! Every mutation is one check-and-mutate step under the state lock. Listeners
//! run after the state lock is released but while `notify` is still held, so
//! they see updates in mutation order and may read the store freely. A
//! listener must not mutate the store (or anything that does) from inside its
//! callback; forward the update to a channel instead, see
//! [`MessageStore::subscribe_channel`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use log::{debug, info};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::types::{
    Attachment, Message, MessageDraft, MessageId, MessageStatus, ParticipantId, Thread, ThreadId,
};

// ============================================================================
// Error Type
// ============================================================================

/// Why an upload-progress update was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressRejection {
    /// The message carries no attachment.
    NoAttachment,
    /// Progress may not go above 100.
    OutOfRange,
    /// Progress may not go backwards.
    Decreased { current: u8 },
    /// The message already failed; its upload is over.
    MessageFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    UnknownThread(ThreadId),
    UnknownMessage(MessageId),
    InvalidTransition {
        message_id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },
    InvalidProgress {
        message_id: MessageId,
        requested: u8,
        reason: ProgressRejection,
    },
    /// An attachment message may only leave `Queued` (other than to
    /// `Failed`) once its upload reached 100.
    UploadIncomplete {
        message_id: MessageId,
        progress: u8,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::UnknownThread(id) => write!(f, "unknown thread: {id}"),
            StoreError::UnknownMessage(id) => write!(f, "unknown message: {id}"),
            StoreError::InvalidTransition { message_id, from, to } => {
                write!(f, "invalid transition for {message_id}: {from} -> {to}")
            }
            StoreError::InvalidProgress {
                message_id,
                requested,
                reason,
            } => {
                let why = match reason {
                    ProgressRejection::NoAttachment => "message has no attachment".to_string(),
                    ProgressRejection::OutOfRange => "progress exceeds 100".to_string(),
                    ProgressRejection::Decreased { current } => {
                        format!("progress would drop from {current}")
                    }
                    ProgressRejection::MessageFailed => "message already failed".to_string(),
                };
                write!(f, "invalid upload progress {requested} for {message_id}: {why}")
            }
            StoreError::UploadIncomplete { message_id, progress } => {
                write!(f, "upload of {message_id} is at {progress}%, not yet sent")
            }
        }
    }
}

impl std::error::Error for StoreError {}

// ============================================================================
// Notifications
// ============================================================================

/// What a single notification is about.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadChange {
    /// Replay of the current state, sent once on subscribe.
    Snapshot,
    MessageAppended {
        message_id: MessageId,
    },
    StatusChanged {
        message_id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },
    UploadProgress {
        message_id: MessageId,
        progress: u8,
    },
    Typing {
        active: bool,
    },
    /// The unread counter went back to zero without any status change.
    UnreadCleared,
}

/// A notification delivered to thread subscribers: the change plus the
/// thread state right after the atomic step that produced it.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ThreadUpdate {
    pub change: ThreadChange,
    pub thread: Thread,
    pub messages: Vec<Message>,
    pub typing: bool,
    /// Messages from other participants since the thread was last read.
    pub unread: usize,
}

impl ThreadUpdate {
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }
}

pub type Listener = Arc<dyn Fn(&ThreadUpdate) + Send + Sync>;

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    thread_id: ThreadId,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = lock(&shared.state);
            if let Some(listeners) = state.listeners.get_mut(&self.thread_id) {
                listeners.retain(|(id, _)| *id != self.id);
            }
            debug!("Unsubscribed listener {} from thread {}", self.id, self.thread_id);
        }
    }
}

// ============================================================================
// State
// ============================================================================

struct ThreadEntry {
    thread: Thread,
    message_ids: Vec<MessageId>,
    typing: bool,
    unread: usize,
}

#[derive(Default)]
struct StoreState {
    /// Whose point of view unread counts are kept from.
    local: Option<ParticipantId>,
    threads: HashMap<ThreadId, ThreadEntry>,
    thread_order: Vec<ThreadId>,
    messages: HashMap<MessageId, Message>,
    listeners: HashMap<ThreadId, Vec<(u64, Listener)>>,
    next_listener_id: u64,
}

impl StoreState {
    fn entry(&self, thread_id: &ThreadId) -> Result<&ThreadEntry, StoreError> {
        self.threads
            .get(thread_id)
            .ok_or_else(|| StoreError::UnknownThread(thread_id.clone()))
    }

    fn message_mut(&mut self, message_id: &MessageId) -> Result<&mut Message, StoreError> {
        self.messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::UnknownMessage(message_id.clone()))
    }

    fn thread_messages(&self, entry: &ThreadEntry) -> Vec<Message> {
        entry
            .message_ids
            .iter()
            .filter_map(|id| self.messages.get(id).cloned())
            .collect()
    }

    fn update_for(&self, thread_id: &ThreadId, change: ThreadChange) -> Option<ThreadUpdate> {
        let entry = self.threads.get(thread_id)?;
        Some(ThreadUpdate {
            change,
            thread: entry.thread.clone(),
            messages: self.thread_messages(entry),
            typing: entry.typing,
            unread: entry.unread,
        })
    }

    fn listeners_for(&self, thread_id: &ThreadId) -> Vec<Listener> {
        self.listeners
            .get(thread_id)
            .map(|ls| ls.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }
}

struct Shared {
    state: Mutex<StoreState>,
    notify: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Changes produced by one atomic step, keyed by the thread they belong to.
type Changes = Vec<(ThreadId, ThreadChange)>;

// ============================================================================
// MessageStore
// ============================================================================

#[derive(Clone)]
pub struct MessageStore {
    shared: Arc<Shared>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    /// A store without a local participant. Nothing counts as unread.
    pub fn new() -> Self {
        Self::with_state(StoreState::default())
    }

    /// A store seen by `local`: messages appended by anyone else raise the
    /// thread's unread count until [`mark_thread_read`](Self::mark_thread_read).
    pub fn for_participant(local: ParticipantId) -> Self {
        Self::with_state(StoreState {
            local: Some(local),
            ..StoreState::default()
        })
    }

    fn with_state(state: StoreState) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                notify: Mutex::new(()),
            }),
        }
    }

    /// Runs `step` atomically, then notifies the listeners of every thread it
    /// touched, in the order the changes were reported.
    fn mutate<T>(
        &self,
        step: impl FnOnce(&mut StoreState) -> Result<(T, Changes), StoreError>,
    ) -> Result<T, StoreError> {
        let _order = lock(&self.shared.notify);
        let (value, pending) = {
            let mut state = lock(&self.shared.state);
            let (value, changes) = step(&mut *state)?;
            let pending: Vec<(Vec<Listener>, ThreadUpdate)> = changes
                .into_iter()
                .filter_map(|(thread_id, change)| {
                    let listeners = state.listeners_for(&thread_id);
                    if listeners.is_empty() {
                        return None;
                    }
                    state
                        .update_for(&thread_id, change)
                        .map(|update| (listeners, update))
                })
                .collect();
            (value, pending)
        };

        for (listeners, update) in &pending {
            for listener in listeners {
                listener(update);
            }
        }
        Ok(value)
    }

    // ------------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------------

    /// Starts a conversation and returns its id.
    pub fn create_thread(
        &self,
        display_name: impl Into<String>,
        participants: impl IntoIterator<Item = ParticipantId>,
        is_group: bool,
    ) -> ThreadId {
        let thread = Thread {
            id: ThreadId::new(),
            display_name: display_name.into(),
            participants: participants.into_iter().collect(),
            is_group,
        };
        let id = thread.id.clone();
        info!("Created thread {} ({})", id, thread.display_name);

        let mut state = lock(&self.shared.state);
        state.thread_order.push(id.clone());
        state.threads.insert(
            id.clone(),
            ThreadEntry {
                thread,
                message_ids: Vec::new(),
                typing: false,
                unread: 0,
            },
        );
        id
    }

    pub fn thread(&self, thread_id: &ThreadId) -> Option<Thread> {
        let state = lock(&self.shared.state);
        state.threads.get(thread_id).map(|e| e.thread.clone())
    }

    /// All threads in creation order.
    pub fn threads(&self) -> Vec<Thread> {
        let state = lock(&self.shared.state);
        state
            .thread_order
            .iter()
            .filter_map(|id| state.threads.get(id).map(|e| e.thread.clone()))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Appends a message to `thread_id`. It starts `Queued` when it carries an
    /// attachment that still has to upload, `Sent` otherwise.
    pub fn append(&self, thread_id: &ThreadId, draft: MessageDraft) -> Result<MessageId, StoreError> {
        self.mutate(|state| {
            state.entry(thread_id)?;

            let attachment = draft.attachment.map(Attachment::from);
            let status = if attachment.is_some() {
                MessageStatus::Queued
            } else {
                MessageStatus::Sent
            };
            let message = Message {
                id: MessageId::new(),
                thread_id: thread_id.clone(),
                sender: draft.sender,
                content: draft.content,
                created_at: Utc::now(),
                status,
                attachment,
            };
            let id = message.id.clone();
            debug!("Appending message {} to thread {} as {}", id, thread_id, status);

            let incoming = state.local.as_ref().is_some_and(|local| local != &message.sender);
            state.messages.insert(id.clone(), message);
            if let Some(entry) = state.threads.get_mut(thread_id) {
                entry.message_ids.push(id.clone());
                if incoming {
                    entry.unread += 1;
                }
            }
            let change = ThreadChange::MessageAppended {
                message_id: id.clone(),
            };
            Ok((id, vec![(thread_id.clone(), change)]))
        })
    }

    /// Moves a message forward along its status machine.
    pub fn update_status(&self, message_id: &MessageId, new_status: MessageStatus) -> Result<(), StoreError> {
        self.mutate(|state| {
            let message = state.message_mut(message_id)?;
            let from = message.status;
            if !from.can_transition_to(new_status) {
                return Err(StoreError::InvalidTransition {
                    message_id: message_id.clone(),
                    from,
                    to: new_status,
                });
            }
            if from == MessageStatus::Queued
                && new_status != MessageStatus::Failed
                && let Some(attachment) = &message.attachment
                && !attachment.is_uploaded()
            {
                return Err(StoreError::UploadIncomplete {
                    message_id: message_id.clone(),
                    progress: attachment.upload_progress,
                });
            }
            message.status = new_status;
            debug!("Message {} status {} -> {}", message_id, from, new_status);

            let change = ThreadChange::StatusChanged {
                message_id: message_id.clone(),
                from,
                to: new_status,
            };
            Ok(((), vec![(message.thread_id.clone(), change)]))
        })
    }

    /// Records upload progress for a message's attachment. Progress never
    /// goes backwards; repeating the current value is accepted.
    pub fn update_upload_progress(&self, message_id: &MessageId, progress: u8) -> Result<(), StoreError> {
        self.mutate(|state| {
            let message = state.message_mut(message_id)?;
            let reject = |reason| StoreError::InvalidProgress {
                message_id: message_id.clone(),
                requested: progress,
                reason,
            };

            if message.status == MessageStatus::Failed {
                return Err(reject(ProgressRejection::MessageFailed));
            }
            let Some(attachment) = message.attachment.as_mut() else {
                return Err(reject(ProgressRejection::NoAttachment));
            };
            if progress > 100 {
                return Err(reject(ProgressRejection::OutOfRange));
            }
            if progress < attachment.upload_progress {
                return Err(reject(ProgressRejection::Decreased {
                    current: attachment.upload_progress,
                }));
            }
            attachment.upload_progress = progress;

            let change = ThreadChange::UploadProgress {
                message_id: message_id.clone(),
                progress,
            };
            Ok(((), vec![(message.thread_id.clone(), change)]))
        })
    }

    /// Raises or lowers the counterparty typing indicator. Only an actual
    /// change of the flag counts as a mutation.
    pub fn set_typing(&self, thread_id: &ThreadId, active: bool) -> Result<(), StoreError> {
        self.mutate(|state| {
            let entry = state
                .threads
                .get_mut(thread_id)
                .ok_or_else(|| StoreError::UnknownThread(thread_id.clone()))?;
            if entry.typing == active {
                return Ok(((), Vec::new()));
            }
            entry.typing = active;
            Ok(((), vec![(thread_id.clone(), ThreadChange::Typing { active })]))
        })
    }

    /// The user opened the thread: every `Delivered` message becomes `Read`
    /// and the unread count drops to zero. Returns how many messages moved.
    /// One notification per moved message, all carrying the post-step
    /// snapshot; a bare [`ThreadChange::UnreadCleared`] if only the counter
    /// changed.
    pub fn mark_thread_read(&self, thread_id: &ThreadId) -> Result<usize, StoreError> {
        self.mutate(|state| {
            let ids = state.entry(thread_id)?.message_ids.clone();
            let mut changes = Vec::new();
            for id in ids {
                if let Some(message) = state.messages.get_mut(&id)
                    && message.status == MessageStatus::Delivered
                {
                    message.status = MessageStatus::Read;
                    changes.push((
                        thread_id.clone(),
                        ThreadChange::StatusChanged {
                            message_id: id,
                            from: MessageStatus::Delivered,
                            to: MessageStatus::Read,
                        },
                    ));
                }
            }
            let moved = changes.len();
            if let Some(entry) = state.threads.get_mut(thread_id) {
                if entry.unread > 0 && changes.is_empty() {
                    changes.push((thread_id.clone(), ThreadChange::UnreadCleared));
                }
                entry.unread = 0;
            }
            if moved > 0 {
                info!("Marked {} message(s) read in thread {}", moved, thread_id);
            }
            Ok((moved, changes))
        })
    }

    pub fn message(&self, message_id: &MessageId) -> Option<Message> {
        lock(&self.shared.state).messages.get(message_id).cloned()
    }

    /// Messages of a thread in append order.
    pub fn messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>, StoreError> {
        let state = lock(&self.shared.state);
        let entry = state.entry(thread_id)?;
        Ok(state.thread_messages(entry))
    }

    pub fn is_typing(&self, thread_id: &ThreadId) -> Result<bool, StoreError> {
        let state = lock(&self.shared.state);
        Ok(state.entry(thread_id)?.typing)
    }

    pub fn unread_count(&self, thread_id: &ThreadId) -> Result<usize, StoreError> {
        let state = lock(&self.shared.state);
        Ok(state.entry(thread_id)?.unread)
    }

    /// Current state of a thread, shaped like a subscriber notification.
    pub fn snapshot(&self, thread_id: &ThreadId) -> Result<ThreadUpdate, StoreError> {
        let state = lock(&self.shared.state);
        state
            .update_for(thread_id, ThreadChange::Snapshot)
            .ok_or_else(|| StoreError::UnknownThread(thread_id.clone()))
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Registers `listener` for `thread_id`. It is called right away with a
    /// [`ThreadChange::Snapshot`], then once per mutation of the thread.
    pub fn subscribe<F>(&self, thread_id: &ThreadId, listener: F) -> Result<Subscription, StoreError>
    where
        F: Fn(&ThreadUpdate) + Send + Sync + 'static,
    {
        let _order = lock(&self.shared.notify);
        let listener: Listener = Arc::new(listener);
        let (id, snapshot) = {
            let mut state = lock(&self.shared.state);
            let snapshot = state
                .update_for(thread_id, ThreadChange::Snapshot)
                .ok_or_else(|| StoreError::UnknownThread(thread_id.clone()))?;
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            state
                .listeners
                .entry(thread_id.clone())
                .or_default()
                .push((id, Arc::clone(&listener)));
            (id, snapshot)
        };
        debug!("Listener {} subscribed to thread {}", id, thread_id);

        listener(&snapshot);
        Ok(Subscription {
            id,
            thread_id: thread_id.clone(),
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Like [`subscribe`](Self::subscribe), but updates arrive on a channel.
    /// The snapshot is already queued when this returns.
    pub fn subscribe_channel(
        &self,
        thread_id: &ThreadId,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<ThreadUpdate>), StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(thread_id, move |update| {
            // Receiver gone means nobody is rendering anymore.
            let _ = tx.send(update.clone());
        })?;
        Ok((subscription, rx))
    }
}
