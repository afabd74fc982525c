use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declares a string-backed identifier newtype with a random v4 constructor.
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identifies a conversation.
    ThreadId
);
id_type!(
    /// Identifies a message within the store.
    MessageId
);
id_type!(
    /// Identifies a deferred send owned by the scheduler.
    ScheduledSendId
);
id_type!(
    /// Identifies a person (or bot) taking part in threads.
    ParticipantId
);

// ============================================================================
// Threads
// ============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Thread {
    pub id: ThreadId,
    pub display_name: String,
    pub participants: BTreeSet<ParticipantId>,
    pub is_group: bool,
}

impl Thread {
    /// First participant other than `sender`, in id order.
    /// This is who answers when the simulator synthesizes a reply.
    pub fn counterparty_of(&self, sender: &ParticipantId) -> Option<&ParticipantId> {
        self.participants.iter().find(|p| *p != sender)
    }
}

// ============================================================================
// Message status
// ============================================================================

/// Delivery state of a message.
///
/// ```text
/// Queued ──upload──▶ Sent ──ack──▶ Delivered ──viewed──▶ Read
///    │                 │
///    └──────┬──────────┘
///           ▼
///         Failed
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position along the happy path. `Failed` sits outside it.
    fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Queued => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }

    /// Whether a message in this status may move to `next`.
    ///
    /// Forward moves along the happy path may skip steps. `Failed` is only
    /// reachable before delivery. Staying put is not a transition.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to > from,
            (Some(_), None) => matches!(self, MessageStatus::Queued | MessageStatus::Sent),
            (None, _) => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Attachments
// ============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    Document,
    Audio,
}

impl AttachmentKind {
    /// Classifies a MIME type. Anything unrecognized is a document.
    pub fn from_mime(mime_type: &str) -> Self {
        let top_level = mime_type.split('/').next().unwrap_or("").trim();
        match top_level.to_ascii_lowercase().as_str() {
            "image" => AttachmentKind::Image,
            "video" => AttachmentKind::Video,
            "audio" => AttachmentKind::Audio,
            _ => AttachmentKind::Document,
        }
    }
}

/// Attachment metadata as handed over by the upload UI.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Explicit kind; derived from `mime_type` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AttachmentKind>,
}

impl AttachmentMeta {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            size_bytes,
            kind: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Percentage in `0..=100`.
    pub upload_progress: u8,
}

impl Attachment {
    pub fn is_uploaded(&self) -> bool {
        self.upload_progress >= 100
    }
}

impl From<AttachmentMeta> for Attachment {
    fn from(meta: AttachmentMeta) -> Self {
        let kind = meta
            .kind
            .unwrap_or_else(|| AttachmentKind::from_mime(&meta.mime_type));
        Attachment {
            kind,
            filename: meta.filename,
            mime_type: meta.mime_type,
            size_bytes: meta.size_bytes,
            upload_progress: 0,
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender: ParticipantId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

/// The caller-supplied half of a message. The store fills in the id,
/// thread, creation time and initial status on append.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub sender: ParticipantId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentMeta>,
}

impl MessageDraft {
    pub fn text(sender: ParticipantId, content: impl Into<String>) -> Self {
        Self {
            sender,
            content: content.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentMeta) -> Self {
        self.attachment = Some(attachment);
        self
    }
}
