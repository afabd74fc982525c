//! Chatline: the message store, scheduler and delivery simulator behind a
//! chat client.

pub mod core;
pub mod delivery;
pub mod messenger;
pub mod scheduler;

#[cfg(test)]
pub mod test_support;

pub use crate::core::store::{MessageStore, StoreError, Subscription, ThreadChange, ThreadUpdate};
pub use crate::core::types::{
    Attachment, AttachmentKind, AttachmentMeta, Message, MessageDraft, MessageId, MessageStatus,
    ParticipantId, ScheduledSendId, Thread, ThreadId,
};
pub use crate::messenger::Messenger;
pub use crate::scheduler::{Repeat, ScheduleError, ScheduleState, ScheduledSend, Scheduler};
