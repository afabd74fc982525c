//! # Delivery Simulator
//!
//! Drives one task per dispatched message through its lifecycle:
//!
//! ```text
//! upload (attachments only)  →  Sent  →  ack  →  Delivered  →  [typing … reply]
//! ```
//!
//! Each running delivery has an entry in `active`. Every store mutation a task
//! makes is applied while holding that map's lock and only if the entry is
//! still there, so once [`DeliverySimulator::cancel`] returns no timer that
//! already woke up can touch the message again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::core::store::{MessageStore, StoreError};
use crate::core::types::{Message, MessageDraft, MessageId, MessageStatus, ThreadId};
use crate::delivery::{DeliveryError, DeliveryPolicy};
use crate::scheduler::Dispatcher;

/// Buffer between a policy's upload and the store writes.
const PROGRESS_BUFFER: usize = 8;

struct ActiveDelivery {
    thread_id: ThreadId,
    handle: Option<AbortHandle>,
    /// This delivery holds the thread's typing indicator up.
    typing: bool,
}

type ActiveMap = HashMap<MessageId, ActiveDelivery>;

/// Raises the typing indicator on behalf of `id`.
fn hold_typing(store: &MessageStore, active: &mut ActiveMap, id: &MessageId) -> Result<(), StoreError> {
    let Some(entry) = active.get_mut(id) else {
        return Ok(());
    };
    entry.typing = true;
    store.set_typing(&entry.thread_id, true)
}

/// Drops `id`'s hold on the typing indicator. The flag only goes down once
/// no other delivery in the thread holds it.
fn release_typing(store: &MessageStore, active: &mut ActiveMap, id: &MessageId) -> Result<(), StoreError> {
    let Some(entry) = active.get_mut(id) else {
        return Ok(());
    };
    if !entry.typing {
        return Ok(());
    }
    entry.typing = false;
    let thread_id = entry.thread_id.clone();
    if active
        .values()
        .any(|other| other.thread_id == thread_id && other.typing)
    {
        return Ok(());
    }
    store.set_typing(&thread_id, false)
}

/// Why a delivery task stopped before finishing.
enum Halt {
    Canceled,
    Store(StoreError),
    Delivery(DeliveryError),
}

struct Inner {
    store: MessageStore,
    policy: Arc<dyn DeliveryPolicy>,
    active: Mutex<ActiveMap>,
    /// Number of running deliveries, republished on every change.
    running: watch::Sender<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// Applies a store mutation on behalf of `id`'s delivery, unless that
    /// delivery has been canceled.
    fn apply<T>(
        &self,
        id: &MessageId,
        mutation: impl FnOnce(&MessageStore, &mut ActiveMap) -> Result<T, StoreError>,
    ) -> Result<T, Halt> {
        let mut active = lock(&self.active);
        if !active.contains_key(id) {
            return Err(Halt::Canceled);
        }
        mutation(&self.store, &mut active).map_err(Halt::Store)
    }

    fn publish(&self, active: &ActiveMap) {
        self.running.send_replace(active.len());
    }

    fn finish(&self, id: &MessageId) {
        let mut active = lock(&self.active);
        active.remove(id);
        self.publish(&active);
    }

    async fn run(self: Arc<Self>, message: Message) {
        let id = message.id.clone();
        match self.drive(&message).await {
            Ok(()) => debug!("Delivery of {} finished", id),
            Err(Halt::Canceled) => debug!("Delivery of {} canceled", id),
            Err(Halt::Delivery(e)) => {
                warn!("Delivery of {} failed: {}", id, e);
                self.fail(&id);
            }
            Err(Halt::Store(e)) => {
                warn!("Delivery of {} stopped by store: {}", id, e);
                self.fail(&id);
            }
        }
        self.finish(&id);
    }

    /// Best effort: a message that already got past `Sent` stays where it is.
    fn fail(&self, id: &MessageId) {
        let result = self.apply(id, |store, active| {
            release_typing(store, active, id)?;
            store.update_status(id, MessageStatus::Failed)
        });
        if let Err(Halt::Store(e)) = result {
            debug!("Could not mark {} failed: {}", id, e);
        }
    }

    async fn drive(&self, message: &Message) -> Result<(), Halt> {
        let id = &message.id;

        if message.attachment.is_some() {
            self.upload(message).await?;
            self.apply(id, |store, _| store.update_status(id, MessageStatus::Sent))?;
        }

        self.policy.acknowledge(message).await.map_err(Halt::Delivery)?;
        self.apply(id, |store, _| store.update_status(id, MessageStatus::Delivered))?;

        if self.policy.will_reply(message) {
            self.auto_reply(message).await?;
        }
        Ok(())
    }

    async fn upload(&self, message: &Message) -> Result<(), Halt> {
        let id = &message.id;
        let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);

        // Owns `rx`, so an early exit closes the channel and ends the upload.
        let consume = async move {
            let mut last = 0;
            while let Some(progress) = rx.recv().await {
                self.apply(id, |store, _| store.update_upload_progress(id, progress))?;
                last = progress;
            }
            Ok::<u8, Halt>(last)
        };
        let (uploaded, consumed) = tokio::join!(self.policy.upload(message, tx), consume);

        let last = consumed?;
        uploaded.map_err(Halt::Delivery)?;
        if last < 100 {
            self.apply(id, |store, _| store.update_upload_progress(id, 100))?;
        }
        Ok(())
    }

    async fn auto_reply(&self, message: &Message) -> Result<(), Halt> {
        let id = &message.id;
        let thread_id = &message.thread_id;
        let Some(thread) = self.store.thread(thread_id) else {
            return Ok(());
        };
        let Some(counterparty) = thread.counterparty_of(&message.sender).cloned() else {
            debug!("Thread {} has nobody to reply to {}", thread_id, id);
            return Ok(());
        };

        self.apply(id, |store, active| hold_typing(store, active, id))?;
        let reply = self.policy.reply(message).await;

        self.apply(id, |store, active| {
            release_typing(store, active, id)?;
            if let Some(text) = reply {
                let reply_id = store.append(thread_id, MessageDraft::text(counterparty, text))?;
                info!("{} replied to {} with {}", thread.display_name, id, reply_id);
            }
            Ok(())
        })
    }
}

/// Runs deliveries for dispatched messages. Cheap to clone; clones share
/// the same set of running deliveries.
#[derive(Clone)]
pub struct DeliverySimulator {
    inner: Arc<Inner>,
}

impl DeliverySimulator {
    pub fn new(store: MessageStore, policy: Arc<dyn DeliveryPolicy>) -> Self {
        info!("Delivery simulator using policy: {}", policy.name());
        let (running, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                store,
                policy,
                active: Mutex::new(HashMap::new()),
                running,
            }),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.inner.store
    }

    /// Appends `draft` to the thread and starts its delivery.
    /// Must be called from within a Tokio runtime.
    pub fn send(&self, thread_id: &ThreadId, draft: MessageDraft) -> Result<MessageId, StoreError> {
        let id = self.inner.store.append(thread_id, draft)?;
        let message = self
            .inner
            .store
            .message(&id)
            .ok_or_else(|| StoreError::UnknownMessage(id.clone()))?;
        self.start(message);
        Ok(id)
    }

    fn start(&self, message: Message) {
        let id = message.id.clone();
        // Hold the lock across spawn so the task cannot apply anything
        // before its entry exists.
        let mut active = lock(&self.inner.active);
        active.insert(
            id.clone(),
            ActiveDelivery {
                thread_id: message.thread_id.clone(),
                handle: None,
                typing: false,
            },
        );
        let task = tokio::spawn(Arc::clone(&self.inner).run(message));
        if let Some(entry) = active.get_mut(&id) {
            entry.handle = Some(task.abort_handle());
        }
        self.inner.publish(&active);
        debug!("Started delivery of {}", id);
    }

    /// Stops the delivery of one message. Its status stays wherever it last
    /// settled. Returns `false` if nothing was running for it.
    pub fn cancel(&self, message_id: &MessageId) -> bool {
        let stopped = {
            let mut active = lock(&self.inner.active);
            let stopped = self.stop(&mut active, message_id);
            self.inner.publish(&active);
            stopped
        };
        if stopped {
            info!("Canceled delivery of {}", message_id);
        }
        stopped
    }

    /// Stops every delivery in a thread, e.g. because it was closed.
    /// Returns how many were stopped.
    pub fn cancel_thread(&self, thread_id: &ThreadId) -> usize {
        let mut active = lock(&self.inner.active);
        let ids: Vec<MessageId> = active
            .iter()
            .filter(|(_, entry)| &entry.thread_id == thread_id)
            .map(|(id, _)| id.clone())
            .collect();
        let mut stopped = 0;
        for id in &ids {
            if self.stop(&mut active, id) {
                stopped += 1;
            }
        }
        self.inner.publish(&active);
        if stopped > 0 {
            info!("Canceled {} deliveries in thread {}", stopped, thread_id);
        }
        stopped
    }

    /// Releases the entry's typing hold, then removes it and aborts its task.
    fn stop(&self, active: &mut ActiveMap, message_id: &MessageId) -> bool {
        if let Err(e) = release_typing(&self.inner.store, active, message_id) {
            warn!("Could not clear typing for {}: {}", message_id, e);
        }
        let Some(entry) = active.remove(message_id) else {
            return false;
        };
        if let Some(handle) = &entry.handle {
            handle.abort();
        }
        true
    }

    pub fn is_active(&self, message_id: &MessageId) -> bool {
        lock(&self.inner.active).contains_key(message_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    /// Follows the number of running deliveries.
    pub fn watch_active(&self) -> watch::Receiver<usize> {
        self.inner.running.subscribe()
    }
}

impl Dispatcher for DeliverySimulator {
    fn dispatch(&self, thread_id: &ThreadId, draft: MessageDraft) -> Result<MessageId, StoreError> {
        self.send(thread_id, draft)
    }
}
