//! Test utilities shared across the crate.
//!
//! This module is only compiled during tests (`#[cfg(test)]`).

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::core::store::{MessageStore, StoreError};
use crate::core::types::{Message, MessageDraft, MessageId, ParticipantId, ThreadId};
use crate::delivery::{DeliveryError, DeliveryPolicy};
use crate::scheduler::Dispatcher;

pub fn me() -> ParticipantId {
    ParticipantId::from("me")
}

pub fn alice() -> ParticipantId {
    ParticipantId::from("alice")
}

/// A fresh store with one direct thread between `me` and `alice`.
pub fn test_thread() -> (MessageStore, ThreadId) {
    let store = MessageStore::new();
    let thread = store.create_thread("Alice", [me(), alice()], false);
    (store, thread)
}

/// Appends straight to the store and counts how often it was called.
pub struct CountingDispatcher {
    store: MessageStore,
    calls: AtomicUsize,
}

impl CountingDispatcher {
    pub fn new(store: MessageStore) -> Self {
        Self {
            store,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }
}

impl Dispatcher for CountingDispatcher {
    fn dispatch(&self, thread_id: &ThreadId, draft: MessageDraft) -> Result<MessageId, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.store.append(thread_id, draft)
    }
}

/// A policy with no delays. Uploads report `upload_to` and stop there.
pub struct InstantPolicy {
    upload_to: u8,
}

impl InstantPolicy {
    pub fn new() -> Self {
        Self { upload_to: 100 }
    }

    /// An upload that ends successfully without ever reporting 100.
    pub fn partial_upload(upload_to: u8) -> Self {
        Self { upload_to }
    }
}

#[async_trait]
impl DeliveryPolicy for InstantPolicy {
    fn name(&self) -> &str {
        "instant"
    }

    async fn upload(&self, _message: &Message, progress: Sender<u8>) -> Result<(), DeliveryError> {
        progress
            .send(self.upload_to)
            .await
            .map_err(|_| DeliveryError::ChannelClosed)
    }

    async fn acknowledge(&self, _message: &Message) -> Result<(), DeliveryError> {
        Ok(())
    }
}
