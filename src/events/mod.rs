use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::sales_order::OrderStatus;
use crate::entities::stock_movement::MovementReason;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving end of a bounded channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Publishes after the state change is durable. Delivery failures are logged
/// and never fail the operation that produced the event.
pub async fn publish(sender: &Option<Arc<EventSender>>, event: Event) {
    if let Some(event_sender) = sender {
        if let Err(e) = event_sender.send(event).await {
            warn!(error = %e, "Failed to publish domain event");
        }
    }
}

/// Domain events emitted by the order and inventory services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated {
        order_id: Uuid,
        order_number: String,
    },
    OrderUpdated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderPaid {
        order_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
    },
    OrderRefunded {
        order_id: Uuid,
        restocked: bool,
    },

    // Inventory events
    StockReceived {
        sku_id: String,
        quantity: i32,
        reason: MovementReason,
    },
    StockIssued {
        sku_id: String,
        quantity: i32,
        reason: MovementReason,
    },
    StockAdjusted {
        sku_id: String,
        old_quantity: i32,
        new_quantity: i32,
    },
    StockLow {
        sku_id: String,
        quantity_on_hand: i32,
        min_stock: i32,
    },
    StockReconciliationMismatch {
        sku_id: String,
        ledger_quantity: i64,
        recorded_quantity: i32,
    },
    SerialUnitRegistered {
        unit_id: Uuid,
        sku_id: String,
    },

    // Installment events
    InstallmentPlanCreated {
        plan_id: Uuid,
        order_id: Uuid,
    },
    InstallmentPaymentApplied {
        plan_id: Uuid,
        amount: Decimal,
        remaining_balance: Decimal,
    },
    InstallmentPlanCompleted(Uuid),
    InstallmentPlanDefaulted(Uuid),
    InstallmentPlanCancelled(Uuid),
}

/// Drains the event channel, logging each event.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");
    while let Some(event) = rx.recv().await {
        match &event {
            Event::StockLow {
                sku_id,
                quantity_on_hand,
                min_stock,
            } => {
                warn!(sku_id = %sku_id, quantity_on_hand, min_stock, "Stock at or below minimum level");
            }
            Event::StockReconciliationMismatch {
                sku_id,
                ledger_quantity,
                recorded_quantity,
            } => {
                error!(
                    sku_id = %sku_id,
                    ledger_quantity,
                    recorded_quantity,
                    "Stock counters disagree with the movement ledger"
                );
            }
            Event::InstallmentPlanDefaulted(plan_id) => {
                warn!(plan_id = %plan_id, "Installment plan defaulted");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(order_id = %order_id, from = %old_status, to = %new_status, "Order status changed");
            }
            _ => {
                info!("Received event: {:?}", event);
            }
        }
    }
    warn!("Event processing loop has ended");
}
