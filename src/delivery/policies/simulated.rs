//! Timer-driven stand-in for a real transport.
//!
//! Upload progress climbs in fixed steps on a fixed interval, acks arrive
//! after a fixed delay, and an optional canned auto-reply follows. All of it
//! runs on `tokio::time`, so a paused test runtime drives it deterministically.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc::Sender;

use crate::core::config::ResolvedConfig;
use crate::core::types::Message;
use crate::delivery::{DeliveryError, DeliveryPolicy};

/// Where an injected failure strikes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// After the first progress step has been reported.
    Upload,
    /// Instead of the delivery acknowledgment.
    Ack,
}

#[derive(Debug, Clone)]
pub struct SimulatedPolicy {
    upload_step: u8,
    upload_interval: Duration,
    ack_delay: Duration,
    auto_reply: Option<(Duration, String)>,
    failure: Option<FailureStage>,
}

impl SimulatedPolicy {
    pub fn new(upload_step: u8, upload_interval: Duration, ack_delay: Duration) -> Self {
        Self {
            upload_step: upload_step.clamp(1, 100),
            upload_interval,
            ack_delay,
            auto_reply: None,
            failure: None,
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        let policy = Self::new(config.upload_step, config.upload_interval, config.ack_delay);
        if config.auto_reply_enabled {
            policy.with_auto_reply(config.auto_reply_delay, config.auto_reply_message.clone())
        } else {
            policy
        }
    }

    pub fn with_auto_reply(mut self, delay: Duration, text: impl Into<String>) -> Self {
        self.auto_reply = Some((delay, text.into()));
        self
    }

    /// Makes every delivery fail at `stage`.
    pub fn with_failure(mut self, stage: FailureStage) -> Self {
        self.failure = Some(stage);
        self
    }

    pub fn upload_step(&self) -> u8 {
        self.upload_step
    }

    pub fn upload_interval(&self) -> Duration {
        self.upload_interval
    }

    pub fn ack_delay(&self) -> Duration {
        self.ack_delay
    }
}

impl Default for SimulatedPolicy {
    fn default() -> Self {
        Self::from_config(&ResolvedConfig::default())
    }
}

#[async_trait]
impl DeliveryPolicy for SimulatedPolicy {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn upload(&self, message: &Message, progress: Sender<u8>) -> Result<(), DeliveryError> {
        let mut percent: u8 = 0;
        while percent < 100 {
            tokio::time::sleep(self.upload_interval).await;
            percent = percent.saturating_add(self.upload_step).min(100);
            progress
                .send(percent)
                .await
                .map_err(|_| DeliveryError::ChannelClosed)?;
            debug!("Simulated upload of {} at {}%", message.id, percent);

            if self.failure == Some(FailureStage::Upload) && percent < 100 {
                return Err(DeliveryError::Transport("simulated upload failure".into()));
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), DeliveryError> {
        tokio::time::sleep(self.ack_delay).await;
        if self.failure == Some(FailureStage::Ack) {
            return Err(DeliveryError::Rejected(format!("no ack for {}", message.id)));
        }
        Ok(())
    }

    fn will_reply(&self, _message: &Message) -> bool {
        self.auto_reply.is_some()
    }

    async fn reply(&self, message: &Message) -> Option<String> {
        let (delay, text) = self.auto_reply.as_ref()?;
        tokio::time::sleep(*delay).await;
        info!("Auto-replying to {}", message.id);
        Some(text.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AttachmentMeta, MessageDraft};
    use crate::test_support::{me, test_thread};
    use tokio::sync::mpsc;

    fn attachment_message() -> Message {
        let (store, thread) = test_thread();
        let draft = MessageDraft::text(me(), "doc").with_attachment(AttachmentMeta::new(
            "report.pdf",
            "application/pdf",
            1024,
        ));
        let id = store.append(&thread, draft).unwrap();
        store.message(&id).unwrap()
    }

    async fn collect(policy: &SimulatedPolicy, message: &Message) -> (Vec<u8>, Result<(), DeliveryError>) {
        let (tx, mut rx) = mpsc::channel(16);
        let result = policy.upload(message, tx).await;
        let mut steps = Vec::new();
        while let Some(p) = rx.recv().await {
            steps.push(p);
        }
        (steps, result)
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_upload_steps_by_twenty() {
        let policy = SimulatedPolicy::default();
        let (steps, result) = collect(&policy, &attachment_message()).await;
        assert!(result.is_ok());
        assert_eq!(steps, vec![20, 40, 60, 80, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uneven_step_caps_at_hundred() {
        let policy = SimulatedPolicy::new(30, Duration::from_millis(10), Duration::ZERO);
        let (steps, _) = collect(&policy, &attachment_message()).await;
        assert_eq!(steps, vec![30, 60, 90, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_takes_interval_per_step() {
        let policy = SimulatedPolicy::new(50, Duration::from_millis(500), Duration::ZERO);
        let start = tokio::time::Instant::now();
        collect(&policy, &attachment_message()).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1010), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_upload_failure() {
        let policy = SimulatedPolicy::default().with_failure(FailureStage::Upload);
        let (steps, result) = collect(&policy, &attachment_message()).await;
        assert_eq!(steps, vec![20]);
        assert!(matches!(result, Err(DeliveryError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_ack_failure() {
        let policy = SimulatedPolicy::default().with_failure(FailureStage::Ack);
        let result = policy.acknowledge(&attachment_message()).await;
        assert!(matches!(result, Err(DeliveryError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_only_when_enabled() {
        let message = attachment_message();
        let silent = SimulatedPolicy::new(20, Duration::ZERO, Duration::ZERO);
        assert!(!silent.will_reply(&message));
        assert_eq!(silent.reply(&message).await, None);

        let chatty = silent.with_auto_reply(Duration::from_secs(3), "hello back");
        assert!(chatty.will_reply(&message));
        assert_eq!(chatty.reply(&message).await.as_deref(), Some("hello back"));
    }

    #[test]
    fn test_from_config_respects_auto_reply_toggle() {
        let mut config = ResolvedConfig::default();
        config.auto_reply_enabled = false;
        let policy = SimulatedPolicy::from_config(&config);
        assert!(policy.auto_reply.is_none());
        assert_eq!(policy.upload_step(), 20);
        assert_eq!(policy.ack_delay(), Duration::from_millis(1000));
    }
}
