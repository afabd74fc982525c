use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::core::types::Message;

/// Errors a delivery policy can report for one message.
/// Any of them ends the message in `Failed`; nothing is retried.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// The transport could not move the bytes (upload or send).
    Transport(String),
    /// The far end refused the message.
    Rejected(String),
    /// The progress receiver went away mid-upload.
    ChannelClosed,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Transport(msg) => write!(f, "transport error: {msg}"),
            DeliveryError::Rejected(msg) => write!(f, "rejected: {msg}"),
            DeliveryError::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

#[async_trait]
pub trait DeliveryPolicy: Send + Sync {
    /// Returns the name of the policy.
    fn name(&self) -> &str;

    /// Uploads the message's attachment, sending percentages (non-decreasing,
    /// ending at 100) to `progress` as they happen.
    async fn upload(&self, message: &Message, progress: Sender<u8>) -> Result<(), DeliveryError>;

    /// Resolves once the transport confirms the message reached the recipient.
    async fn acknowledge(&self, message: &Message) -> Result<(), DeliveryError>;

    /// Whether the counterparty answers this message at all.
    fn will_reply(&self, _message: &Message) -> bool {
        false
    }

    /// Produces the counterparty's answer. Time spent here is shown to the
    /// user as the typing indicator.
    async fn reply(&self, _message: &Message) -> Option<String> {
        None
    }
}
