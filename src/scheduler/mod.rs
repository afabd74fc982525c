//! # Scheduler
//!
//! Holds drafts until their send time, then hands each to a [`Dispatcher`]
//! exactly once.
//!
//! ```text
//! schedule() ──► Pending ──(timer fires)──► Fired ──► Dispatcher::dispatch
//!                   │                         │
//!                   │                         └──(repeating)──► next Pending entry
//!                   └──(cancel)──► Canceled
//! ```
//!
//! `Fired` and `Canceled` are final. Both transitions happen under the
//! entries lock, so when a cancel and a timer race, whichever takes the lock
//! first wins and the other sees the final state. A repeating send is a chain
//! of entries, each with its own id; canceling the pending link ends it.
//!
//! Settled entries stay readable through [`Scheduler::get`] until
//! [`Scheduler::prune_settled`] drops them.
//!
//! Every entry owns its timer task. Dropping the scheduler does not stop
//! them; call [`Scheduler::shutdown`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Months, TimeDelta, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::core::clock::Clock;
use crate::core::store::{MessageStore, StoreError};
use crate::core::types::{MessageDraft, MessageId, ScheduledSendId, ThreadId};

// ============================================================================
// Dispatcher
// ============================================================================

/// Where fired drafts go. Called outside every scheduler lock.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, thread_id: &ThreadId, draft: MessageDraft) -> Result<MessageId, StoreError>;
}

// ============================================================================
// Types
// ============================================================================

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleState {
    Pending,
    Fired,
    Canceled,
}

/// How often a scheduled send comes back after it fires.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    #[default]
    #[serde(rename = "none")]
    Once,
    Daily,
    Weekly,
    /// Same day next month, clamped to the month's last day.
    Monthly,
}

impl Repeat {
    /// The occurrence after one due at `at`, or `None` for [`Repeat::Once`].
    pub fn next_after(self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Repeat::Once => None,
            Repeat::Daily => at.checked_add_signed(TimeDelta::days(1)),
            Repeat::Weekly => at.checked_add_signed(TimeDelta::weeks(1)),
            Repeat::Monthly => at.checked_add_months(Months::new(1)),
        }
    }
}

/// A draft waiting for its send time.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScheduledSend {
    pub id: ScheduledSendId,
    pub thread_id: ThreadId,
    pub message: MessageDraft,
    pub fire_at: DateTime<Utc>,
    pub state: ScheduleState,
    pub repeat: Repeat,
    /// The message created when this fired, if dispatch succeeded.
    pub dispatched: Option<MessageId>,
    /// The following occurrence, registered when this one fired.
    pub next: Option<ScheduledSendId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleError {
    PastTime {
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    AlreadyFired(ScheduledSendId),
    NotFound(ScheduledSendId),
    Store(StoreError),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::PastTime { fire_at, now } => {
                write!(f, "send time {} is not after now ({})", fire_at.to_rfc3339(), now.to_rfc3339())
            }
            ScheduleError::AlreadyFired(id) => write!(f, "scheduled send {id} already fired"),
            ScheduleError::NotFound(id) => write!(f, "no scheduled send {id}"),
            ScheduleError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for ScheduleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScheduleError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for ScheduleError {
    fn from(e: StoreError) -> Self {
        ScheduleError::Store(e)
    }
}

// ============================================================================
// Scheduler
// ============================================================================

struct Entry {
    send: ScheduledSend,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct Book {
    entries: HashMap<ScheduledSendId, Entry>,
    /// Claimed entries whose dispatch has not returned yet.
    firing: usize,
}

impl Book {
    /// Pending entries plus the ones mid-dispatch.
    fn outstanding(&self) -> usize {
        let pending = self
            .entries
            .values()
            .filter(|entry| entry.send.state == ScheduleState::Pending)
            .count();
        pending + self.firing
    }
}

struct Inner {
    store: MessageStore,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Clock,
    book: Mutex<Book>,
    outstanding: watch::Sender<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn publish(&self, book: &Book) {
        self.outstanding.send_replace(book.outstanding());
    }

    /// Adds a pending entry and starts its timer. The caller holds the lock.
    fn register(
        self: &Arc<Self>,
        book: &mut Book,
        thread_id: &ThreadId,
        draft: MessageDraft,
        fire_at: DateTime<Utc>,
        repeat: Repeat,
    ) -> ScheduledSendId {
        let id = ScheduledSendId::new();
        let delay = self.clock.until(fire_at).unwrap_or(Duration::ZERO);
        let inner = Arc::clone(self);
        let timer_id = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(&timer_id);
        });
        book.entries.insert(
            id.clone(),
            Entry {
                send: ScheduledSend {
                    id: id.clone(),
                    thread_id: thread_id.clone(),
                    message: draft,
                    fire_at,
                    state: ScheduleState::Pending,
                    repeat,
                    dispatched: None,
                    next: None,
                },
                timer: Some(task.abort_handle()),
            },
        );
        self.publish(book);
        id
    }

    /// Timer callback. Claims the entry, queues the next occurrence of a
    /// repeating send, then dispatches outside the lock.
    fn fire(self: &Arc<Self>, id: &ScheduledSendId) {
        let claimed = {
            let mut book = lock(&self.book);
            let claimed = match book.entries.get_mut(id) {
                Some(entry) if entry.send.state == ScheduleState::Pending => {
                    entry.send.state = ScheduleState::Fired;
                    entry.timer = None;
                    Some(entry.send.clone())
                }
                _ => None,
            };
            if let Some(send) = &claimed {
                book.firing += 1;
                if let Some(next_at) = send.repeat.next_after(send.fire_at) {
                    let next =
                        self.register(&mut book, &send.thread_id, send.message.clone(), next_at, send.repeat);
                    debug!("Scheduled send {} repeats as {}", id, next);
                    if let Some(entry) = book.entries.get_mut(id) {
                        entry.send.next = Some(next);
                    }
                }
                self.publish(&book);
            }
            claimed
        };
        let Some(send) = claimed else {
            debug!("Timer for {} woke after it was settled", id);
            return;
        };

        let result = self.dispatcher.dispatch(&send.thread_id, send.message);
        let mut book = lock(&self.book);
        book.firing -= 1;
        match result {
            Ok(message_id) => {
                info!("Scheduled send {} fired as {}", id, message_id);
                if let Some(entry) = book.entries.get_mut(id) {
                    entry.send.dispatched = Some(message_id);
                }
            }
            Err(e) => warn!("Scheduled send {} fired but dispatch failed: {}", id, e),
        }
        self.publish(&book);
    }
}

/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(store: MessageStore, dispatcher: Arc<dyn Dispatcher>, clock: Clock) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                clock,
                book: Mutex::new(Book::default()),
                outstanding,
            }),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// Registers `draft` to be dispatched into `thread_id` at `fire_at`.
    /// Must be called from within a Tokio runtime.
    pub fn schedule(
        &self,
        thread_id: &ThreadId,
        draft: MessageDraft,
        fire_at: DateTime<Utc>,
    ) -> Result<ScheduledSendId, ScheduleError> {
        self.schedule_repeating(thread_id, draft, fire_at, Repeat::Once)
    }

    /// Like [`Scheduler::schedule`], but each firing queues the next
    /// occurrence according to `repeat`.
    pub fn schedule_repeating(
        &self,
        thread_id: &ThreadId,
        draft: MessageDraft,
        fire_at: DateTime<Utc>,
        repeat: Repeat,
    ) -> Result<ScheduledSendId, ScheduleError> {
        if self.inner.store.thread(thread_id).is_none() {
            return Err(StoreError::UnknownThread(thread_id.clone()).into());
        }
        if self.inner.clock.until(fire_at).is_none() {
            return Err(ScheduleError::PastTime {
                fire_at,
                now: self.inner.clock.now(),
            });
        }

        let mut book = lock(&self.inner.book);
        let id = self.inner.register(&mut book, thread_id, draft, fire_at, repeat);
        info!(
            "Scheduled {} in thread {} for {} ({:?})",
            id,
            thread_id,
            fire_at.to_rfc3339(),
            repeat
        );
        Ok(id)
    }

    /// Relative form of [`Scheduler::schedule`].
    pub fn schedule_in(
        &self,
        thread_id: &ThreadId,
        draft: MessageDraft,
        delay: Duration,
    ) -> Result<ScheduledSendId, ScheduleError> {
        let now = self.inner.clock.now();
        let fire_at = TimeDelta::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.schedule(thread_id, draft, fire_at)
    }

    /// Cancels a pending send. Canceling an already canceled send is a no-op.
    pub fn cancel(&self, id: &ScheduledSendId) -> Result<(), ScheduleError> {
        let mut book = lock(&self.inner.book);
        let entry = book
            .entries
            .get_mut(id)
            .ok_or_else(|| ScheduleError::NotFound(id.clone()))?;
        match entry.send.state {
            ScheduleState::Pending => {
                entry.send.state = ScheduleState::Canceled;
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                self.inner.publish(&book);
                info!("Canceled scheduled send {}", id);
                Ok(())
            }
            ScheduleState::Fired => Err(ScheduleError::AlreadyFired(id.clone())),
            ScheduleState::Canceled => Ok(()),
        }
    }

    pub fn get(&self, id: &ScheduledSendId) -> Option<ScheduledSend> {
        lock(&self.inner.book)
            .entries
            .get(id)
            .map(|entry| entry.send.clone())
    }

    /// Sends still waiting to fire, soonest first.
    pub fn pending(&self) -> Vec<ScheduledSend> {
        let mut pending: Vec<ScheduledSend> = lock(&self.inner.book)
            .entries
            .values()
            .filter(|entry| entry.send.state == ScheduleState::Pending)
            .map(|entry| entry.send.clone())
            .collect();
        pending.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    /// Pending sends plus any whose dispatch is still running.
    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.borrow()
    }

    /// Follows [`Scheduler::outstanding`].
    pub fn watch_outstanding(&self) -> watch::Receiver<usize> {
        self.inner.outstanding.subscribe()
    }

    /// Forgets fired and canceled entries. Afterwards their ids are
    /// `NotFound`. Returns how many were dropped.
    pub fn prune_settled(&self) -> usize {
        let mut book = lock(&self.inner.book);
        let before = book.entries.len();
        book.entries
            .retain(|_, entry| entry.send.state == ScheduleState::Pending);
        let pruned = before - book.entries.len();
        debug!("Pruned {} settled scheduled sends", pruned);
        pruned
    }

    /// Cancels everything still pending. Returns how many were canceled.
    pub fn shutdown(&self) -> usize {
        let mut book = lock(&self.inner.book);
        let mut canceled = 0;
        for entry in book.entries.values_mut() {
            if entry.send.state != ScheduleState::Pending {
                continue;
            }
            entry.send.state = ScheduleState::Canceled;
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            canceled += 1;
        }
        self.inner.publish(&book);
        if canceled > 0 {
            info!("Scheduler shut down, canceled {} pending sends", canceled);
        }
        canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{me, test_thread, CountingDispatcher};
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    fn scheduler() -> (Scheduler, Arc<CountingDispatcher>, ThreadId) {
        let (store, thread) = test_thread();
        let dispatcher = Arc::new(CountingDispatcher::new(store.clone()));
        let scheduler = Scheduler::new(store, dispatcher.clone(), Clock::new());
        (scheduler, dispatcher, thread)
    }

    fn draft(text: &str) -> MessageDraft {
        MessageDraft::text(me(), text)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_exactly_once() {
        let (scheduler, dispatcher, thread) = scheduler();
        let id = assert_ok!(scheduler.schedule_in(&thread, draft("later"), Duration::from_millis(100)));

        sleep(Duration::from_millis(99)).await;
        assert_eq!(dispatcher.count(), 0);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(dispatcher.count(), 1);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(dispatcher.count(), 1);

        let send = scheduler.get(&id).unwrap();
        assert_eq!(send.state, ScheduleState::Fired);
        assert!(send.dispatched.is_some());
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_just_before_fire() {
        let (scheduler, dispatcher, thread) = scheduler();
        let id = assert_ok!(scheduler.schedule_in(&thread, draft("race"), Duration::from_millis(50)));

        sleep(Duration::from_millis(49)).await;
        let outcome = scheduler.cancel(&id);
        sleep(Duration::from_millis(100)).await;

        let state = scheduler.get(&id).unwrap().state;
        match outcome {
            Ok(()) => {
                assert_eq!(state, ScheduleState::Canceled);
                assert_eq!(dispatcher.count(), 0);
            }
            Err(e) => {
                assert_eq!(e, ScheduleError::AlreadyFired(id));
                assert_eq!(state, ScheduleState::Fired);
                assert_eq!(dispatcher.count(), 1);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_reports_already_fired() {
        let (scheduler, dispatcher, thread) = scheduler();
        let id = assert_ok!(scheduler.schedule_in(&thread, draft("x"), Duration::from_millis(50)));
        sleep(Duration::from_millis(51)).await;

        let err = assert_err!(scheduler.cancel(&id));
        assert_eq!(err, ScheduleError::AlreadyFired(id));
        assert_eq!(dispatcher.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_cancel_is_noop() {
        let (scheduler, dispatcher, thread) = scheduler();
        let id = assert_ok!(scheduler.schedule_in(&thread, draft("x"), Duration::from_secs(1)));
        assert_ok!(scheduler.cancel(&id));
        assert_ok!(scheduler.cancel(&id));
        sleep(Duration::from_secs(2)).await;
        assert_eq!(dispatcher.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_past_and_present() {
        let (scheduler, _, thread) = scheduler();
        let now = scheduler.clock().now();

        let err = assert_err!(scheduler.schedule(&thread, draft("x"), now));
        assert!(matches!(err, ScheduleError::PastTime { .. }));
        let err = assert_err!(scheduler.schedule(&thread, draft("x"), now - TimeDelta::seconds(5)));
        assert!(matches!(err, ScheduleError::PastTime { .. }));
        let err = assert_err!(scheduler.schedule_in(&thread, draft("x"), Duration::ZERO));
        assert!(matches!(err, ScheduleError::PastTime { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_ids_and_threads() {
        let (scheduler, _, _) = scheduler();
        let missing = ScheduledSendId::from("nope");
        assert_eq!(
            scheduler.cancel(&missing),
            Err(ScheduleError::NotFound(missing.clone()))
        );
        assert_eq!(scheduler.get(&missing), None);

        let thread = ThreadId::from("ghost");
        let err = assert_err!(scheduler.schedule_in(&thread, draft("x"), Duration::from_secs(1)));
        assert_eq!(err, ScheduleError::Store(StoreError::UnknownThread(thread)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_ordered_by_fire_time() {
        let (scheduler, _, thread) = scheduler();
        let late = assert_ok!(scheduler.schedule_in(&thread, draft("late"), Duration::from_secs(30)));
        let soon = assert_ok!(scheduler.schedule_in(&thread, draft("soon"), Duration::from_secs(5)));
        let mid = assert_ok!(scheduler.schedule_in(&thread, draft("mid"), Duration::from_secs(10)));
        assert_ok!(scheduler.cancel(&mid));

        let ids: Vec<ScheduledSendId> = scheduler.pending().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![soon, late]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending() {
        let (scheduler, dispatcher, thread) = scheduler();
        let fired = assert_ok!(scheduler.schedule_in(&thread, draft("a"), Duration::from_millis(10)));
        assert_ok!(scheduler.schedule_in(&thread, draft("b"), Duration::from_secs(1)));
        assert_ok!(scheduler.schedule_in(&thread, draft("c"), Duration::from_secs(2)));
        sleep(Duration::from_millis(20)).await;

        assert_eq!(scheduler.shutdown(), 2);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(dispatcher.count(), 1);
        assert_eq!(scheduler.get(&fired).unwrap().state, ScheduleState::Fired);
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_draft_not_in_store_until_fired() {
        let (scheduler, dispatcher, thread) = scheduler();
        assert_ok!(scheduler.schedule_in(&thread, draft("hidden"), Duration::from_secs(1)));
        assert!(dispatcher.store().messages(&thread).unwrap().is_empty());

        sleep(Duration::from_millis(1001)).await;
        let messages = dispatcher.store().messages(&thread).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hidden");
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_send_fires_as_a_chain() {
        let (scheduler, dispatcher, thread) = scheduler();
        let first_at = scheduler.clock().now() + TimeDelta::hours(1);
        let first = assert_ok!(scheduler.schedule_repeating(&thread, draft("standup"), first_at, Repeat::Daily));

        sleep(Duration::from_secs(3601)).await;
        assert_eq!(dispatcher.count(), 1);
        let fired = scheduler.get(&first).unwrap();
        assert_eq!(fired.state, ScheduleState::Fired);
        let second = fired.next.expect("daily send queues its next occurrence");

        let queued = scheduler.get(&second).unwrap();
        assert_eq!(queued.state, ScheduleState::Pending);
        assert_eq!(queued.fire_at, first_at + TimeDelta::days(1));
        assert_eq!(queued.repeat, Repeat::Daily);
        assert_eq!(scheduler.pending().len(), 1);

        sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(dispatcher.count(), 2);
        let third = scheduler.get(&second).unwrap().next.unwrap();

        // Canceling the pending link ends the chain.
        assert_ok!(scheduler.cancel(&third));
        sleep(Duration::from_secs(3 * 24 * 3600)).await;
        assert_eq!(dispatcher.count(), 2);
        assert!(scheduler.pending().is_empty());

        let err = assert_err!(scheduler.cancel(&first));
        assert_eq!(err, ScheduleError::AlreadyFired(first));
    }

    #[test]
    fn test_repeat_next_after() {
        let at = DateTime::parse_from_rfc3339("2024-01-31T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(Repeat::Once.next_after(at), None);
        assert_eq!(Repeat::Daily.next_after(at), Some(at + TimeDelta::days(1)));
        assert_eq!(Repeat::Weekly.next_after(at), Some(at + TimeDelta::days(7)));
        let feb = DateTime::parse_from_rfc3339("2024-02-29T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(Repeat::Monthly.next_after(at), Some(feb));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_settled_keeps_pending() {
        let (scheduler, _, thread) = scheduler();
        let fired = assert_ok!(scheduler.schedule_in(&thread, draft("a"), Duration::from_millis(10)));
        let canceled = assert_ok!(scheduler.schedule_in(&thread, draft("b"), Duration::from_secs(1)));
        let waiting = assert_ok!(scheduler.schedule_in(&thread, draft("c"), Duration::from_secs(5)));
        assert_ok!(scheduler.cancel(&canceled));
        sleep(Duration::from_millis(20)).await;

        assert_eq!(scheduler.prune_settled(), 2);
        assert_eq!(scheduler.get(&fired), None);
        assert_eq!(scheduler.cancel(&canceled), Err(ScheduleError::NotFound(canceled.clone())));
        assert_eq!(scheduler.get(&waiting).unwrap().state, ScheduleState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outstanding_tracks_pending_and_firing() {
        let (scheduler, _, thread) = scheduler();
        let mut outstanding = scheduler.watch_outstanding();
        assert_ok!(scheduler.schedule_in(&thread, draft("a"), Duration::from_millis(10)));
        let later = assert_ok!(scheduler.schedule_in(&thread, draft("b"), Duration::from_secs(1)));
        assert_eq!(*outstanding.borrow_and_update(), 2);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.outstanding(), 1);
        assert_ok!(scheduler.cancel(&later));
        assert_eq!(*outstanding.borrow_and_update(), 0);
    }
}
