use super::*;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::TimeZone;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use storage::InMemoryMessageRepository;

/// Accepts nothing: every write fails.
struct FailingRepository;

#[async_trait]
impl MessageRepository for FailingRepository {
    async fn append_confirmed_message(
        &self,
        _room_id: &RoomId,
        _message: &StoredMessage,
    ) -> anyhow::Result<()> {
        Err(anyhow!("disk full"))
    }

    fn stream_messages<'a>(
        &'a self,
        _room_id: &'a RoomId,
    ) -> BoxStream<'a, anyhow::Result<StoredMessage>> {
        stream::once(async { Err(anyhow!("disk unreadable")) }).boxed()
    }

    async fn update_message_content(
        &self,
        _room_id: &RoomId,
        _message_id: &MessageId,
        _content: &str,
    ) -> anyhow::Result<bool> {
        Err(anyhow!("disk full"))
    }

    async fn mark_message_deleted(
        &self,
        _room_id: &RoomId,
        _message_id: &MessageId,
    ) -> anyhow::Result<bool> {
        Err(anyhow!("disk full"))
    }
}

/// Fails the first `failures` appends, then behaves like the in-memory store.
struct FlakyRepository {
    failures: AtomicUsize,
    inner: InMemoryMessageRepository,
}

impl FlakyRepository {
    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            inner: InMemoryMessageRepository::new(),
        })
    }
}

#[async_trait]
impl MessageRepository for FlakyRepository {
    async fn append_confirmed_message(
        &self,
        room_id: &RoomId,
        message: &StoredMessage,
    ) -> anyhow::Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("database is locked"));
        }
        self.inner.append_confirmed_message(room_id, message).await
    }

    fn stream_messages<'a>(
        &'a self,
        room_id: &'a RoomId,
    ) -> BoxStream<'a, anyhow::Result<StoredMessage>> {
        self.inner.stream_messages(room_id)
    }

    async fn update_message_content(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        content: &str,
    ) -> anyhow::Result<bool> {
        self.inner.update_message_content(room_id, message_id, content).await
    }

    async fn mark_message_deleted(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
    ) -> anyhow::Result<bool> {
        self.inner.mark_message_deleted(room_id, message_id).await
    }
}

fn alice() -> UserId {
    UserId::new("alice")
}

fn room() -> RoomId {
    RoomId::new("room1")
}

fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap()
}

fn outgoing(id: &str, content: &str) -> OutgoingMessage {
    let mut message = OutgoingMessage::new(alice(), content);
    message.message_id = MessageId::new(id);
    message
}

fn received(id: &str, sender: &str, content: &str, second: u32) -> ChatEvent {
    ChatEvent::MessageReceived {
        message_id: MessageId::new(id),
        sender_id: UserId::new(sender),
        content: content.to_string(),
        reply_to_message_id: None,
        timestamp: at(second),
    }
}

fn stored(id: &str, sender: &str, second: u32) -> StoredMessage {
    StoredMessage {
        message_id: MessageId::new(id),
        room_id: room(),
        sender_id: UserId::new(sender),
        content: format!("body of {id}"),
        reply_to_message_id: None,
        sent_at: at(second),
        edited: false,
        deleted: false,
    }
}

fn ids(entries: &[TimelineEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.message_id.as_str()).collect()
}

fn drain_updates(rx: &mut broadcast::Receiver<ReconcilerUpdate>) -> Vec<ReconcilerUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

#[tokio::test]
async fn own_echo_marks_record_delivered_then_retires_it() {
    let repository = Arc::new(InMemoryMessageRepository::new());
    let reconciler = DeliveryReconciler::new(alice(), repository.clone());
    let record = reconciler.begin_send(&room(), &outgoing("m1", "hello")).await;
    assert_eq!(record.delivery_state, DeliveryState::Sending);
    let mut updates = reconciler.subscribe();

    reconciler
        .apply_event(&room(), received("m1", "alice", "hello", 1))
        .await
        .unwrap();

    let updates = drain_updates(&mut updates);
    assert!(updates.iter().any(|u| matches!(
        u,
        ReconcilerUpdate::RecordChanged(r) if r.message_id == MessageId::new("m1")
            && r.delivery_state == DeliveryState::Delivered
    )));
    assert!(matches!(
        updates.last(),
        Some(ReconcilerUpdate::RecordRetired { message_id, .. }) if message_id == &MessageId::new("m1")
    ));
    assert!(reconciler.record(&MessageId::new("m1")).await.is_none());
    assert_eq!(repository.len(&room()).await, 1);

    let timeline = reconciler.timeline(&room()).await;
    assert_eq!(ids(&timeline), vec!["m1"]);
    assert_eq!(timeline[0].delivery_state, DeliveryState::Delivered);
    assert!(timeline[0].is_mine);
}

#[tokio::test]
async fn record_stays_delivered_until_persisted() {
    let reconciler = DeliveryReconciler::new(alice(), Arc::new(FailingRepository));
    reconciler.begin_send(&room(), &outgoing("m1", "hello")).await;

    let result = reconciler
        .apply_event(&room(), received("m1", "alice", "hello", 1))
        .await;

    assert!(matches!(result, Err(ReconcileError::Persist { .. })));
    let record = reconciler.record(&MessageId::new("m1")).await.unwrap();
    assert_eq!(record.delivery_state, DeliveryState::Delivered);

    let timeline = reconciler.timeline(&room()).await;
    assert_eq!(ids(&timeline), vec!["m1"]);
    assert_eq!(timeline[0].local_id, Some(record.local_id));
}

#[tokio::test]
async fn duplicate_broadcasts_yield_one_confirmed_message() {
    let repository = Arc::new(InMemoryMessageRepository::new());
    let reconciler = DeliveryReconciler::new(alice(), repository.clone());

    for _ in 0..2 {
        reconciler
            .apply_event(&room(), received("m1", "bob", "hi", 1))
            .await
            .unwrap();
    }

    assert_eq!(ids(&reconciler.timeline(&room()).await), vec!["m1"]);
    assert_eq!(repository.len(&room()).await, 1);
}

#[tokio::test]
async fn confirmed_messages_follow_server_time_and_pending_ones_trail() {
    let reconciler = DeliveryReconciler::new(alice(), Arc::new(InMemoryMessageRepository::new()));
    reconciler.begin_send(&room(), &outgoing("mine-1", "first")).await;
    reconciler.begin_send(&room(), &outgoing("mine-2", "second")).await;
    reconciler.mark_failed(&MessageId::new("mine-1"), "offline").await;

    reconciler
        .apply_event(&room(), received("late", "bob", "b", 30))
        .await
        .unwrap();
    reconciler
        .apply_event(&room(), received("early", "carol", "c", 10))
        .await
        .unwrap();

    let timeline = reconciler.timeline(&room()).await;
    assert_eq!(ids(&timeline), vec!["early", "late", "mine-1", "mine-2"]);
    assert_eq!(
        timeline[2].delivery_state,
        DeliveryState::Failed("offline".into())
    );
    assert_eq!(timeline[3].delivery_state, DeliveryState::Sending);
    assert!(!timeline[0].is_mine);
}

#[tokio::test]
async fn remote_message_reusing_an_id_is_not_a_delivery() {
    let reconciler = DeliveryReconciler::new(alice(), Arc::new(InMemoryMessageRepository::new()));
    reconciler.begin_send(&room(), &outgoing("m1", "hello")).await;
    let mut updates = reconciler.subscribe();

    reconciler
        .apply_event(&room(), received("m1", "mallory", "spoof", 1))
        .await
        .unwrap();

    assert!(!drain_updates(&mut updates).iter().any(|u| matches!(
        u,
        ReconcilerUpdate::RecordChanged(r) if r.delivery_state == DeliveryState::Delivered
    )));
    let timeline = reconciler.timeline(&room()).await;
    assert_eq!(ids(&timeline), vec!["m1"]);
    assert!(!timeline[0].is_mine);
    assert!(reconciler.record(&MessageId::new("m1")).await.is_none());
}

#[tokio::test]
async fn sent_never_downgrades_a_delivered_record() {
    let reconciler = DeliveryReconciler::new(alice(), Arc::new(FailingRepository));
    let id = MessageId::new("m1");
    reconciler.begin_send(&room(), &outgoing("m1", "hello")).await;
    let _ = reconciler
        .apply_event(&room(), received("m1", "alice", "hello", 1))
        .await;

    assert!(!reconciler.mark_sent(&id).await);
    assert!(!reconciler.mark_failed(&id, "late failure").await);
    assert_eq!(
        reconciler.record(&id).await.unwrap().delivery_state,
        DeliveryState::Delivered
    );
}

#[tokio::test]
async fn queue_outcomes_drive_delivery_state() {
    let reconciler = DeliveryReconciler::new(alice(), Arc::new(InMemoryMessageRepository::new()));
    let sent = outgoing("m1", "one");
    let lost = outgoing("m2", "two");
    reconciler.begin_send(&room(), &sent).await;
    reconciler.begin_send(&room(), &lost).await;

    reconciler
        .apply_queue_event(&QueueEvent::Transmitted(QueuedAction::Send {
            message: sent,
            room_id: room(),
        }))
        .await;
    reconciler
        .apply_queue_event(&QueueEvent::Failed(DeliveryFailure {
            action: QueuedAction::Send {
                message: lost,
                room_id: room(),
            },
            reason: "not connected".into(),
        }))
        .await;

    assert_eq!(
        reconciler.record(&MessageId::new("m1")).await.unwrap().delivery_state,
        DeliveryState::Sent
    );
    assert_eq!(
        reconciler.record(&MessageId::new("m2")).await.unwrap().delivery_state,
        DeliveryState::Failed("not connected".into())
    );
}

#[tokio::test]
async fn retry_reenters_sending_with_the_same_message_id() {
    let reconciler = DeliveryReconciler::new(alice(), Arc::new(InMemoryMessageRepository::new()));
    let id = MessageId::new("m1");
    let first = reconciler
        .begin_send(&room(), &outgoing("m1", "hello").replying_to(MessageId::new("m0")))
        .await;

    assert!(matches!(
        reconciler.begin_retry(&id).await,
        Err(ReconcileError::NotRetryable { .. })
    ));

    reconciler.mark_failed(&id, "gave up").await;
    let (room_id, message) = reconciler.begin_retry(&id).await.unwrap();

    assert_eq!(room_id, room());
    assert_eq!(message.message_id, id);
    assert_eq!(message.content, "hello");
    assert_eq!(message.reply_to_message_id, Some(MessageId::new("m0")));
    let record = reconciler.record(&id).await.unwrap();
    assert_eq!(record.delivery_state, DeliveryState::Sending);
    assert_ne!(record.local_id, first.local_id);

    assert!(matches!(
        reconciler.begin_retry(&MessageId::new("nope")).await,
        Err(ReconcileError::UnknownMessage(_))
    ));
}

#[tokio::test]
async fn edits_and_deletes_update_view_and_repository() {
    let repository = Arc::new(InMemoryMessageRepository::new());
    let reconciler = DeliveryReconciler::new(alice(), repository.clone());
    reconciler
        .apply_event(&room(), received("m1", "bob", "draft", 1))
        .await
        .unwrap();
    reconciler
        .apply_event(&room(), received("m2", "bob", "oops", 2))
        .await
        .unwrap();

    reconciler
        .apply_event(
            &room(),
            ChatEvent::MessageEdited {
                message_id: MessageId::new("m1"),
                new_content: "final".into(),
                timestamp: at(3),
            },
        )
        .await
        .unwrap();
    reconciler
        .apply_event(
            &room(),
            ChatEvent::MessageDeleted {
                message_id: MessageId::new("m2"),
                timestamp: at(4),
            },
        )
        .await
        .unwrap();

    let timeline = reconciler.timeline(&room()).await;
    assert_eq!(ids(&timeline), vec!["m1", "m2"]);
    assert_eq!(timeline[0].content, "final");
    assert!(timeline[0].edited);
    assert!(timeline[1].deleted);

    let persisted: Vec<StoredMessage> = repository
        .stream_messages(&room())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(persisted[0].content, "final");
    assert!(persisted[0].edited);
    assert!(persisted[1].deleted);
}

#[tokio::test]
async fn history_seeds_the_view_without_duplicates() {
    let repository = Arc::new(InMemoryMessageRepository::new());
    repository
        .append_confirmed_message(&room(), &stored("old-2", "bob", 20))
        .await
        .unwrap();
    repository
        .append_confirmed_message(&room(), &stored("old-1", "carol", 10))
        .await
        .unwrap();
    let reconciler = DeliveryReconciler::new(alice(), repository.clone());

    assert_eq!(reconciler.load_history(&room()).await.unwrap(), 2);
    assert_eq!(reconciler.load_history(&room()).await.unwrap(), 0);
    reconciler
        .apply_event(&room(), received("old-2", "bob", "again", 20))
        .await
        .unwrap();

    assert_eq!(
        ids(&reconciler.timeline(&room()).await),
        vec!["old-1", "old-2"]
    );
}

#[tokio::test]
async fn unreadable_history_is_reported() {
    let reconciler = DeliveryReconciler::new(alice(), Arc::new(FailingRepository));

    let err = reconciler.load_history(&room()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::History { .. }));
    assert!(err.to_string().contains("disk unreadable"));
}

#[tokio::test]
async fn system_and_error_events_are_forwarded() {
    let reconciler = DeliveryReconciler::new(alice(), Arc::new(InMemoryMessageRepository::new()));
    let mut updates = reconciler.subscribe();

    reconciler
        .apply_event(
            &room(),
            ChatEvent::SystemMessage {
                content: "bob joined".into(),
                timestamp: at(5),
            },
        )
        .await
        .unwrap();
    reconciler
        .apply_event(
            &room(),
            ChatEvent::Error {
                message: "rate limited".into(),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        drain_updates(&mut updates),
        vec![
            ReconcilerUpdate::System {
                room_id: room(),
                content: "bob joined".into(),
                timestamp: at(5),
            },
            ReconcilerUpdate::ServerError {
                room_id: room(),
                message: "rate limited".into(),
            },
        ]
    );
    assert!(reconciler.timeline(&room()).await.is_empty());
}

#[tokio::test]
async fn repeated_echo_retries_a_failed_persist() {
    let repository = FlakyRepository::failing(1);
    let reconciler = DeliveryReconciler::new(alice(), repository.clone());
    reconciler.begin_send(&room(), &outgoing("m1", "hello")).await;

    let first = reconciler
        .apply_event(&room(), received("m1", "alice", "hello", 1))
        .await;
    assert!(matches!(first, Err(ReconcileError::Persist { .. })));
    assert!(reconciler.record(&MessageId::new("m1")).await.is_some());

    reconciler
        .apply_event(&room(), received("m1", "alice", "hello", 1))
        .await
        .unwrap();

    assert_eq!(repository.inner.len(&room()).await, 1);
    assert!(reconciler.record(&MessageId::new("m1")).await.is_none());
    assert_eq!(ids(&reconciler.timeline(&room()).await), vec!["m1"]);

    reconciler
        .apply_event(&room(), received("m1", "alice", "hello", 1))
        .await
        .unwrap();
    assert_eq!(repository.inner.len(&room()).await, 1);
}

#[tokio::test]
async fn pending_records_follow_local_creation_order_not_the_clock() {
    let reconciler = DeliveryReconciler::new(alice(), Arc::new(InMemoryMessageRepository::new()));
    let first = outgoing("m1", "first");
    let mut second = outgoing("m2", "second");
    second.created_at = first.created_at - chrono::Duration::seconds(30);

    reconciler.begin_send(&room(), &first).await;
    reconciler.begin_send(&room(), &second).await;

    assert_eq!(ids(&reconciler.timeline(&room()).await), vec!["m1", "m2"]);
}

#[tokio::test]
async fn edit_before_confirmation_marks_the_pending_entry_edited() {
    let reconciler = DeliveryReconciler::new(alice(), Arc::new(InMemoryMessageRepository::new()));
    reconciler.begin_send(&room(), &outgoing("m1", "tpyo")).await;

    reconciler
        .apply_event(
            &room(),
            ChatEvent::MessageEdited {
                message_id: MessageId::new("m1"),
                new_content: "typo".into(),
                timestamp: at(2),
            },
        )
        .await
        .unwrap();

    let timeline = reconciler.timeline(&room()).await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].content, "typo");
    assert!(timeline[0].edited);
    assert_eq!(timeline[0].delivery_state, DeliveryState::Sending);
}
