//! Fire-and-forget domain events.
//!
//! Core operations call [`Notifier::notify`] after their snapshot commits.
//! `notify` never blocks and never fails: delivery problems are logged and
//! the event is dropped.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bazaar_storage::{
    EscrowId, ProposalId, RequestId, SettlementId, UserId, VerificationId, VerificationStatus,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    ProposalSubmitted {
        request_id: RequestId,
        proposal_id: ProposalId,
        buyer_id: UserId,
        seller_id: UserId,
        price: i64,
    },
    ProposalSelected {
        request_id: RequestId,
        proposal_id: ProposalId,
        escrow_id: EscrowId,
        buyer_id: UserId,
        seller_id: UserId,
    },
    VerificationAssigned {
        verification_id: VerificationId,
        seller_id: UserId,
        verifier_id: UserId,
    },
    VerificationCompleted {
        verification_id: VerificationId,
        seller_id: UserId,
        verifier_id: Option<UserId>,
        status: VerificationStatus,
        score: Option<u8>,
    },
    SettlementPaid {
        settlement_id: SettlementId,
        seller_id: UserId,
        amount: i64,
        currency: String,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::ProposalSubmitted { .. } => "proposal_submitted",
            NotificationEvent::ProposalSelected { .. } => "proposal_selected",
            NotificationEvent::VerificationAssigned { .. } => "verification_assigned",
            NotificationEvent::VerificationCompleted { .. } => "verification_completed",
            NotificationEvent::SettlementPaid { .. } => "settlement_paid",
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotificationEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: NotificationEvent) {}
}

/// Keeps every event in memory, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: NotificationEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct SinkError(pub String);

/// Downstream consumer of outbox events (email, webhooks, ...).
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), SinkError>;
}

/// Sink that writes each event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        let payload = serde_json::to_string(event).map_err(|e| SinkError(e.to_string()))?;
        tracing::info!(kind = event.kind(), %payload, "notification");
        Ok(())
    }
}

/// Bounded queue drained by a background task.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    tx: mpsc::Sender<NotificationEvent>,
}

impl OutboxNotifier {
    /// Spawn the drain task on the current tokio runtime. The task ends
    /// once every `OutboxNotifier` clone has been dropped and the queue is
    /// empty.
    pub fn spawn<K: NotificationSink>(sink: K, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<NotificationEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.deliver(&event).await {
                    tracing::warn!(kind = event.kind(), error = %e, "dropping notification");
                }
            }
        });
        (Self { tx }, handle)
    }
}

impl Notifier for OutboxNotifier {
    fn notify(&self, event: NotificationEvent) {
        use mpsc::error::TrySendError;
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(kind = event.kind(), "notification queue full; dropping");
            }
            Err(TrySendError::Closed(event)) => {
                tracing::warn!(kind = event.kind(), "notification outbox closed; dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> NotificationEvent {
        NotificationEvent::SettlementPaid {
            settlement_id: SettlementId::new(),
            seller_id: UserId::new(),
            amount: 255_035,
            currency: "USD".into(),
        }
    }

    struct Collect(Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl NotificationSink for Collect {
        async fn deliver(&self, event: &NotificationEvent) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(event.kind());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl NotificationSink for Failing {
        async fn deliver(&self, _event: &NotificationEvent) -> Result<(), SinkError> {
            Err(SinkError("smtp down".into()))
        }
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["type"], "settlement_paid");
        assert_eq!(json["amount"], 255_035);
    }

    #[tokio::test]
    async fn outbox_delivers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (outbox, handle) = OutboxNotifier::spawn(Collect(seen.clone()), 8);
        outbox.notify(event());
        outbox.notify(NotificationEvent::VerificationAssigned {
            verification_id: VerificationId::new(),
            seller_id: UserId::new(),
            verifier_id: UserId::new(),
        });
        drop(outbox);
        handle.await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["settlement_paid", "verification_assigned"]
        );
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_the_outbox() {
        let (outbox, handle) = OutboxNotifier::spawn(Failing, 2);
        outbox.notify(event());
        outbox.notify(event());
        drop(outbox);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        // Current-thread runtime: the drain task cannot run until we yield.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (outbox, handle) = OutboxNotifier::spawn(Collect(seen.clone()), 1);
        for _ in 0..5 {
            outbox.notify(event());
        }
        drop(outbox);
        handle.await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
