//! # Messenger
//!
//! The command surface a chat UI talks to. Wires one store, one delivery
//! simulator and one scheduler together:
//!
//! ```text
//!  send ─────────────────────────────┐
//!                                    ▼
//!  schedule ──► Scheduler ──(fire)──► DeliverySimulator ──► MessageStore ──► subscribers
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::sync::mpsc;

use crate::core::clock::Clock;
use crate::core::config::ResolvedConfig;
use crate::core::store::{MessageStore, StoreError, Subscription, ThreadUpdate};
use crate::core::types::{MessageDraft, MessageId, ParticipantId, ScheduledSendId, Thread, ThreadId};
use crate::delivery::{DeliveryPolicy, DeliverySimulator, SimulatedPolicy};
use crate::scheduler::{Repeat, ScheduleError, ScheduledSend, Scheduler};

pub struct Messenger {
    local: ParticipantId,
    store: MessageStore,
    simulator: DeliverySimulator,
    scheduler: Scheduler,
}

impl Messenger {
    pub fn new(policy: Arc<dyn DeliveryPolicy>, local: ParticipantId) -> Self {
        Self::with_clock(policy, local, Clock::new())
    }

    pub fn with_clock(policy: Arc<dyn DeliveryPolicy>, local: ParticipantId, clock: Clock) -> Self {
        let store = MessageStore::for_participant(local.clone());
        let simulator = DeliverySimulator::new(store.clone(), policy);
        let scheduler = Scheduler::new(store.clone(), Arc::new(simulator.clone()), clock);
        Self {
            local,
            store,
            simulator,
            scheduler,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        let policy = SimulatedPolicy::from_config(config);
        Self::new(
            Arc::new(policy),
            ParticipantId::from(config.local_participant.as_str()),
        )
    }

    pub fn local_participant(&self) -> &ParticipantId {
        &self.local
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn simulator(&self) -> &DeliverySimulator {
        &self.simulator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Opens a thread between the local participant and `others`. More than
    /// one other participant makes it a group.
    pub fn create_thread(
        &self,
        display_name: impl Into<String>,
        others: impl IntoIterator<Item = ParticipantId>,
    ) -> ThreadId {
        let others: Vec<ParticipantId> = others.into_iter().collect();
        let is_group = others.len() > 1;
        self.store
            .create_thread(display_name, std::iter::once(self.local.clone()).chain(others), is_group)
    }

    /// A text draft from the local participant.
    pub fn draft(&self, content: impl Into<String>) -> MessageDraft {
        MessageDraft::text(self.local.clone(), content)
    }

    /// Appends now and starts delivery.
    pub fn send(&self, thread_id: &ThreadId, draft: MessageDraft) -> Result<MessageId, StoreError> {
        self.simulator.send(thread_id, draft)
    }

    pub fn schedule(
        &self,
        thread_id: &ThreadId,
        draft: MessageDraft,
        fire_at: DateTime<Utc>,
    ) -> Result<ScheduledSendId, ScheduleError> {
        self.scheduler.schedule(thread_id, draft, fire_at)
    }

    pub fn schedule_in(
        &self,
        thread_id: &ThreadId,
        draft: MessageDraft,
        delay: Duration,
    ) -> Result<ScheduledSendId, ScheduleError> {
        self.scheduler.schedule_in(thread_id, draft, delay)
    }

    pub fn schedule_repeating(
        &self,
        thread_id: &ThreadId,
        draft: MessageDraft,
        fire_at: DateTime<Utc>,
        repeat: Repeat,
    ) -> Result<ScheduledSendId, ScheduleError> {
        self.scheduler.schedule_repeating(thread_id, draft, fire_at, repeat)
    }

    pub fn cancel(&self, id: &ScheduledSendId) -> Result<(), ScheduleError> {
        self.scheduler.cancel(id)
    }

    /// Stops an in-flight delivery, leaving its status where it is.
    pub fn cancel_delivery(&self, message_id: &MessageId) -> bool {
        self.simulator.cancel(message_id)
    }

    /// Cancels the thread's pending scheduled sends and running deliveries.
    /// Returns how many of each were stopped.
    pub fn close_thread(&self, thread_id: &ThreadId) -> (usize, usize) {
        let scheduled = self
            .scheduler
            .pending()
            .into_iter()
            .filter(|send| &send.thread_id == thread_id)
            .filter(|send| self.scheduler.cancel(&send.id).is_ok())
            .count();
        let deliveries = self.simulator.cancel_thread(thread_id);
        info!(
            "Closed thread {}: {} scheduled, {} deliveries canceled",
            thread_id, scheduled, deliveries
        );
        (scheduled, deliveries)
    }

    /// The user viewed the thread.
    pub fn mark_read(&self, thread_id: &ThreadId) -> Result<usize, StoreError> {
        self.store.mark_thread_read(thread_id)
    }

    pub fn subscribe<F>(&self, thread_id: &ThreadId, listener: F) -> Result<Subscription, StoreError>
    where
        F: Fn(&ThreadUpdate) + Send + Sync + 'static,
    {
        self.store.subscribe(thread_id, listener)
    }

    pub fn subscribe_channel(
        &self,
        thread_id: &ThreadId,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<ThreadUpdate>), StoreError> {
        self.store.subscribe_channel(thread_id)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn threads(&self) -> Vec<Thread> {
        self.store.threads()
    }

    pub fn pending_sends(&self) -> Vec<ScheduledSend> {
        self.scheduler.pending()
    }

    pub fn is_idle(&self) -> bool {
        self.simulator.active_count() == 0 && self.scheduler.outstanding() == 0
    }

    /// Waits until no scheduled send is pending and no delivery is running.
    /// A repeating send keeps the messenger busy until it is canceled.
    pub async fn settle(&self) {
        let mut active = self.simulator.watch_active();
        let mut outstanding = self.scheduler.watch_outstanding();
        loop {
            // A fired send counts as outstanding until its delivery is
            // registered, so both reading zero means idle.
            if *outstanding.borrow_and_update() == 0 && *active.borrow_and_update() == 0 {
                break;
            }
            tokio::select! {
                changed = active.changed() => if changed.is_err() { break },
                changed = outstanding.changed() => if changed.is_err() { break },
            }
        }
        debug!("Messenger settled");
    }

    /// Cancels all pending sends and running deliveries.
    pub fn shutdown(&self) {
        let scheduled = self.scheduler.shutdown();
        let deliveries: usize = self
            .store
            .threads()
            .iter()
            .map(|thread| self.simulator.cancel_thread(&thread.id))
            .sum();
        info!(
            "Messenger shut down: {} scheduled, {} deliveries canceled",
            scheduled, deliveries
        );
    }
}
