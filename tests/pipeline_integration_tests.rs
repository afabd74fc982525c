use std::sync::Arc;
use std::time::Duration;

use chatline::delivery::{FailureStage, SimulatedPolicy};
use chatline::{
    AttachmentMeta, MessageDraft, MessageStatus, MessageStore, Messenger, ParticipantId,
    ScheduleState, ThreadChange, ThreadUpdate,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tokio_test::assert_ok;

// ============================================================================
// Helper Functions
// ============================================================================

fn policy() -> SimulatedPolicy {
    SimulatedPolicy::new(20, Duration::from_millis(500), Duration::from_millis(1000))
}

fn messenger_with(policy: SimulatedPolicy) -> Messenger {
    Messenger::new(Arc::new(policy), ParticipantId::from("me"))
}

/// Drains everything already queued on a subscription channel.
fn drain(rx: &mut UnboundedReceiver<ThreadUpdate>) -> Vec<ThreadUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_and_canceled_schedule_scenario() {
    let messenger = messenger_with(policy());
    let thread = messenger.create_thread("Alice", [ParticipantId::from("alice")]);

    let m1 = assert_ok!(messenger.send(&thread, messenger.draft("m1")));
    assert_eq!(messenger.store().message(&m1).unwrap().status, MessageStatus::Sent);

    let m2 = assert_ok!(messenger.schedule_in(&thread, messenger.draft("m2"), Duration::from_secs(1)));
    sleep(Duration::from_millis(200)).await;
    assert_ok!(messenger.cancel(&m2));

    sleep(Duration::from_millis(900)).await;
    assert_eq!(messenger.store().message(&m1).unwrap().status, MessageStatus::Delivered);

    sleep(Duration::from_secs(5)).await;
    let messages = messenger.store().messages(&thread).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "m1");
    assert_eq!(messenger.scheduler().get(&m2).unwrap().state, ScheduleState::Canceled);
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_gets_snapshot_then_one_update_per_mutation() {
    let store = MessageStore::new();
    let me = ParticipantId::from("me");
    let thread = store.create_thread("Alice", [me.clone(), ParticipantId::from("alice")], false);
    for text in ["one", "two", "three"] {
        assert_ok!(store.append(&thread, MessageDraft::text(me.clone(), text)));
    }

    let (_sub, mut rx) = assert_ok!(store.subscribe_channel(&thread));
    let replay = drain(&mut rx);
    assert_eq!(replay.len(), 1);
    assert_eq!(replay[0].change, ThreadChange::Snapshot);
    assert_eq!(replay[0].messages.len(), 3);

    let id = assert_ok!(store.append(&thread, MessageDraft::text(me, "four")));
    let updates = drain(&mut rx);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].change, ThreadChange::MessageAppended { message_id: id });
    assert_eq!(updates[0].messages.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_attachment_progress_reaches_hundred_before_sent() {
    let messenger = messenger_with(policy());
    let thread = messenger.create_thread("Alice", [ParticipantId::from("alice")]);
    let (_sub, mut rx) = assert_ok!(messenger.subscribe_channel(&thread));

    let draft = messenger
        .draft("photo")
        .with_attachment(AttachmentMeta::new("beach.jpg", "image/jpeg", 2048));
    let id = assert_ok!(messenger.send(&thread, draft));
    messenger.settle().await;

    let mut last_progress = 0;
    let mut statuses = vec![MessageStatus::Queued];
    for update in drain(&mut rx) {
        let message = update.message(&id).cloned();
        match update.change {
            ThreadChange::UploadProgress { progress, .. } => {
                assert!(progress >= last_progress);
                assert_eq!(message.unwrap().status, MessageStatus::Queued);
                last_progress = progress;
            }
            ThreadChange::StatusChanged { to, .. } => {
                assert_eq!(last_progress, 100);
                statuses.push(to);
            }
            _ => {}
        }
    }
    assert_eq!(
        statuses,
        vec![MessageStatus::Queued, MessageStatus::Sent, MessageStatus::Delivered]
    );
}

#[tokio::test(start_paused = true)]
async fn test_auto_reply_and_read_receipts() {
    let messenger = messenger_with(policy().with_auto_reply(Duration::from_secs(3), "On my way"));
    let thread = messenger.create_thread("Alice", [ParticipantId::from("alice")]);
    let (_sub, mut rx) = assert_ok!(messenger.subscribe_channel(&thread));

    let id = assert_ok!(messenger.send(&thread, messenger.draft("Where are you?")));
    messenger.settle().await;

    let typing: Vec<bool> = drain(&mut rx)
        .into_iter()
        .filter_map(|u| match u.change {
            ThreadChange::Typing { active } => Some(active),
            _ => None,
        })
        .collect();
    assert_eq!(typing, vec![true, false]);

    let messages = messenger.store().messages(&thread).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].sender, ParticipantId::from("alice"));
    assert_eq!(messages[1].content, "On my way");

    assert_eq!(assert_ok!(messenger.mark_read(&thread)), 1);
    assert_eq!(messenger.store().message(&id).unwrap().status, MessageStatus::Read);
}

#[tokio::test(start_paused = true)]
async fn test_failed_ack_ends_in_failed() {
    let messenger = messenger_with(policy().with_failure(FailureStage::Ack));
    let thread = messenger.create_thread("Alice", [ParticipantId::from("alice")]);
    let id = assert_ok!(messenger.send(&thread, messenger.draft("hello?")));
    messenger.settle().await;

    assert_eq!(messenger.store().message(&id).unwrap().status, MessageStatus::Failed);
    assert_eq!(assert_ok!(messenger.mark_read(&thread)), 0);
}
