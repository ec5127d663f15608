use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Notifications emitted after a unit of work commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        total_amount: Decimal,
    },
    PaymentSubmitted {
        order_id: Uuid,
        payment_id: Uuid,
    },
    PaymentConfirmed {
        order_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
    },
    PaymentRejected {
        order_id: Uuid,
        payment_id: Uuid,
        reason: Option<String>,
    },
    OrderCancelled {
        order_id: Uuid,
    },
    CartCleared {
        user_id: Uuid,
        order_id: Uuid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::PaymentSubmitted { .. } => "payment_submitted",
            Event::PaymentConfirmed { .. } => "payment_confirmed",
            Event::PaymentRejected { .. } => "payment_rejected",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::CartCleared { .. } => "cart_cleared",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Fire-and-forget send. The unit of work has already committed, so a
    /// full or closed channel drops the notification with a log line instead
    /// of holding up the response.
    pub fn send_or_log(&self, event: Event) {
        let name = event.name();
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(event = name, "Notification queue full, dropping notification");
                metrics::counter!("pharmacy.events.dropped", 1, "reason" => "full");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(event = name, "Notification queue closed, dropping notification");
                metrics::counter!("pharmacy.events.dropped", 1, "reason" => "closed");
            }
        }
    }
}

/// Outbound messaging collaborator (email, SMS, push).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> Result<(), String>;
}

/// Default notifier: structured log line per event.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, event: &Event) -> Result<(), String> {
        match event {
            Event::OrderCreated {
                order_id,
                user_id,
                total_amount,
            } => info!(%order_id, %user_id, %total_amount, "order created"),
            Event::PaymentSubmitted {
                order_id,
                payment_id,
            } => info!(%order_id, %payment_id, "payment submitted"),
            Event::PaymentConfirmed {
                order_id,
                payment_id,
                amount,
            } => info!(%order_id, %payment_id, %amount, "payment confirmed"),
            Event::PaymentRejected {
                order_id,
                payment_id,
                reason,
            } => info!(%order_id, %payment_id, reason = ?reason, "payment rejected"),
            Event::OrderCancelled { order_id } => info!(%order_id, "order cancelled"),
            Event::CartCleared { user_id, order_id } => {
                info!(%user_id, %order_id, "cart cleared")
            }
        }
        Ok(())
    }
}

/// Drains the channel into the notifier until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, notifier: Arc<dyn Notifier>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        if let Err(e) = notifier.notify(&event).await {
            error!(event = event.name(), error = %e, "Failed to deliver notification");
            metrics::counter!("pharmacy.events.failed", 1);
        }
    }

    info!("Event processing loop stopped");
}
